use crate::engine::ExecutionEngine;
use crate::store::{BoardRepository, ExecutionStore};
use boardcore::{
    BoardId, EngineError, EventBus, Execution, ExecutionEvent, ExecutionId, ExecutionStatus,
    NodeExecutor, RunRequest, StoreError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker-pool bound per stage
    pub max_parallel_nodes: usize,
    pub node_timeout_ms: Option<u64>,
    pub run_timeout_ms: Option<u64>,
    /// Turn schema mismatches into validation errors
    pub strict_schemas: bool,
    pub max_loop_iterations: u32,
    pub event_buffer_size: usize,
}

impl RuntimeConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            node_timeout_ms: None,
            run_timeout_ms: None,
            strict_schemas: false,
            max_loop_iterations: 1000,
            event_buffer_size: 1000,
        }
    }
}

/// Handle onto a spawned run.
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    cancellation: CancellationToken,
    join: JoinHandle<Result<Execution, EngineError>>,
}

impl ExecutionHandle {
    /// Request cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<Execution, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?
    }
}

/// Trigger surface for board runs.
///
/// Every submitted run gets its own `ExecutionEngine` over a fresh board
/// snapshot; the runtime only keeps the cancellation tokens of runs in flight.
pub struct BoardRuntime {
    repository: Arc<dyn BoardRepository>,
    store: Arc<dyn ExecutionStore>,
    executor: Arc<dyn NodeExecutor>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
    active: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
}

impl BoardRuntime {
    /// Create a new runtime with default settings
    pub fn new(
        repository: Arc<dyn BoardRepository>,
        store: Arc<dyn ExecutionStore>,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        let config = RuntimeConfig::default();
        Self {
            repository,
            store,
            executor,
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the configuration. Rebuilds the event bus, so subscribe after.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        self.config = config;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run a board to a terminal state.
    pub async fn execute(
        &self,
        board_id: BoardId,
        request: RunRequest,
    ) -> Result<Execution, EngineError> {
        self.spawn(board_id, request).await?.wait().await
    }

    /// Submit a run and return immediately.
    ///
    /// The execution record exists in the store by the time this returns.
    pub async fn spawn(
        &self,
        board_id: BoardId,
        request: RunRequest,
    ) -> Result<ExecutionHandle, EngineError> {
        let board = self.repository.load(board_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::BoardNotFound(board_id),
            other => EngineError::Store(other),
        })?;

        let execution = Execution::new(board.id, &request);
        let execution_id = execution.id;
        self.store.create(&execution).await?;
        self.repository.record_execution(board_id).await?;

        tracing::info!(
            execution_id = %execution_id,
            board_id = %board_id,
            "Submitted {} run of board '{}' by {}",
            request.execution_type,
            board.name,
            request.initiated_by
        );

        let cancellation = CancellationToken::new();
        self.active
            .write()
            .await
            .insert(execution_id, cancellation.clone());

        let engine = ExecutionEngine::new(Arc::new(board), self.executor.clone(), self.store.clone())
            .with_config(self.config.clone())
            .with_event_bus(self.event_bus.clone())
            .with_cancellation(cancellation.clone());
        let active = self.active.clone();

        let join = tokio::spawn(async move {
            let result = engine.run_execution(execution).await;
            active.write().await.remove(&execution_id);
            result
        });

        Ok(ExecutionHandle {
            execution_id,
            cancellation,
            join,
        })
    }

    /// Cancel a run in flight. Cancelling a finished run is a no-op.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        if let Some(token) = self.active.read().await.get(&execution_id) {
            tracing::info!(execution_id = %execution_id, "Cancellation requested");
            token.cancel();
            return Ok(());
        }
        self.execution(execution_id).await.map(|_| ())
    }

    pub async fn status(&self, execution_id: ExecutionId) -> Result<ExecutionStatus, EngineError> {
        Ok(self.execution(execution_id).await?.status)
    }

    /// Current record of a run, as last persisted.
    pub async fn execution(&self, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        self.store.get(execution_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::ExecutionNotFound(execution_id),
            other => EngineError::Store(other),
        })
    }

    /// Run a terminal execution again as a new record.
    ///
    /// The new run uses the board's current definition with the prior run's
    /// type and trigger data. The prior record is left untouched.
    pub async fn retry(&self, execution_id: ExecutionId) -> Result<Execution, EngineError> {
        let prior = self.execution(execution_id).await?;
        if !prior.is_terminal() {
            return Err(EngineError::IllegalTransition {
                from: prior.status,
                to: ExecutionStatus::Running,
            });
        }
        tracing::info!(
            execution_id = %execution_id,
            board_id = %prior.board_id,
            "Retrying {:?} run",
            prior.status
        );
        let request = prior.retry_request(prior.initiated_by.clone());
        self.execute(prior.board_id, request).await
    }

    /// Ids of runs currently in flight.
    pub async fn active_executions(&self) -> Vec<ExecutionId> {
        self.active.read().await.keys().copied().collect()
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}
