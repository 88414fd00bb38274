use crate::{BoardId, EngineError, NodeId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Run-level status. Transitions only move forward; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            // a validation failure or an early cancel skips RUNNING
            (Pending, Failed) | (Pending, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

/// Per-node status within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// What a caller submits to start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub initiated_by: String,
    pub execution_type: String,
    #[serde(default)]
    pub trigger_data: Value,
}

impl RunRequest {
    pub fn manual(initiated_by: impl Into<String>) -> Self {
        Self {
            initiated_by: initiated_by.into(),
            execution_type: "manual".to_string(),
            trigger_data: Value::Null,
        }
    }

    pub fn with_type(mut self, execution_type: impl Into<String>) -> Self {
        self.execution_type = execution_type.into();
        self
    }

    pub fn with_trigger_data(mut self, data: impl Into<Value>) -> Self {
        self.trigger_data = data.into();
        self
    }
}

/// One run of a board. Owned by the engine driving it until terminal, then an
/// immutable historical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub board_id: BoardId,
    pub initiated_by: String,
    pub status: ExecutionStatus,
    pub execution_type: String,
    pub trigger_data: Value,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result_data: Option<RunResult>,
    pub error_message: Option<String>,
    pub execution_log: Vec<LogEntry>,
}

impl Execution {
    pub fn new(board_id: BoardId, request: &RunRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id,
            initiated_by: request.initiated_by.clone(),
            status: ExecutionStatus::Pending,
            execution_type: request.execution_type.clone(),
            trigger_data: request.trigger_data.clone(),
            total_nodes: 0,
            completed_nodes: 0,
            failed_nodes: 0,
            skipped_nodes: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result_data: None,
            error_message: None,
            execution_log: Vec::new(),
        }
    }

    /// Request that re-runs this execution's board with the same trigger.
    pub fn retry_request(&self, initiated_by: impl Into<String>) -> RunRequest {
        RunRequest {
            initiated_by: initiated_by.into(),
            execution_type: self.execution_type.clone(),
            trigger_data: self.trigger_data.clone(),
        }
    }

    /// Move to `next`, stamping start and completion times.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            let started = *self.started_at.get_or_insert(now);
            self.completed_at = Some(now);
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
        self.status = next;
        Ok(())
    }

    pub fn resolved_nodes(&self) -> usize {
        self.completed_nodes + self.failed_nodes + self.skipped_nodes
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append a log entry with the next sequence number.
    pub fn log(&mut self, node_id: Option<NodeId>, event: LogEvent, detail: Option<String>) -> &LogEntry {
        let entry = LogEntry {
            sequence: self.execution_log.len() as u64,
            node_id,
            event,
            timestamp: Utc::now(),
            detail,
        };
        self.execution_log.push(entry);
        &self.execution_log[self.execution_log.len() - 1]
    }
}

/// Append-only record in an execution log. `sequence` reflects plan order,
/// `timestamp` is wall-clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub node_id: Option<NodeId>,
    pub event: LogEvent,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted,
    ValidationFailed,
    StageStarted,
    NodeStarted,
    NodeSucceeded,
    NodeFailed,
    NodeSkipped,
    NodeCancelled,
    ConditionError,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

/// Summary stored in `Execution::result_data` once the run is terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub partial_failure: bool,
    pub node_states: BTreeMap<NodeId, NodeStatus>,
    pub outputs: BTreeMap<NodeId, Value>,
    pub errors: Vec<NodeFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub message: String,
    /// True when the node never ran and failed because its critical inputs failed.
    pub propagated: bool,
}
