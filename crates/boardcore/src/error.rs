use crate::{BoardId, ConnectionId, ExecutionId, ExecutionStatus, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoardError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems that prevent a board from running.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Connection {connection} references unknown node {node}")]
    UnknownNode {
        connection: ConnectionId,
        node: NodeId,
    },

    #[error("Connection {connection} belongs to board {found}, expected {expected}")]
    ForeignConnection {
        connection: ConnectionId,
        expected: BoardId,
        found: BoardId,
    },

    #[error("Node {node} belongs to board {found}, expected {expected}")]
    ForeignNode {
        node: NodeId,
        expected: BoardId,
        found: BoardId,
    },

    #[error("Board has no active start node")]
    MissingStartNode,

    #[error("Board has no active end node")]
    MissingEndNode,

    #[error("Cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<NodeId> },

    #[error("Nodes unreachable from any start node: {}", format_path(.nodes))]
    Unreachable { nodes: Vec<NodeId> },

    #[error("Loop node {node} declares {max_iterations} iterations (allowed 1..={limit})")]
    UnboundedLoop {
        node: NodeId,
        max_iterations: u32,
        limit: u32,
    },

    #[error("Schema mismatch on connection {connection}: {message}")]
    SchemaMismatch {
        connection: ConnectionId,
        message: String,
    },
}

fn format_path(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure to parse or evaluate a connection condition. Never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Cannot parse '{expression}' at {position}: {message}")]
    Parse {
        expression: String,
        position: usize,
        message: String,
    },

    #[error("Cannot evaluate '{expression}': {message}")]
    Evaluation { expression: String, message: String },

    #[error("Expression too complex: {0}")]
    TooComplex(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unsupported node: {0}")]
    Unsupported(String),

    /// The executor backend could not be reached. Escalated to a fatal engine error.
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Execution {0} is terminal and cannot be modified")]
    TerminalRecord(ExecutionId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that stop a run, or prevent one from starting.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Board {board_id} failed validation: {source}")]
    Validation {
        board_id: BoardId,
        execution_id: Option<ExecutionId>,
        #[source]
        source: ValidationError,
    },

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Node executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error("Illegal status transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Board not found: {0}")]
    BoardNotFound(BoardId),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Run task failed: {0}")]
    Join(String),
}
