//! Core abstractions for the board engine
//!
//! This crate provides the board data model, execution records, the node
//! executor capability and the error taxonomy that the runtime and node
//! crates build on.

mod board;
mod error;
pub mod events;
mod execution;
mod node;
mod value;

pub use board::{
    Board, BoardId, Connection, ConnectionId, NodeId, NodeKind, NodeSpec, PortSchema, ValueType,
};
pub use error::{BoardError, ConditionError, EngineError, NodeError, StoreError, ValidationError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, NodeEvent};
pub use execution::{
    Execution, ExecutionId, ExecutionStatus, LogEntry, LogEvent, NodeFailure, NodeStatus,
    RunRequest, RunResult,
};
pub use node::{InvocationHandle, LoopIteration, NodeContext, NodeExecutor, NodeMetadata, NodeOutput};
pub use value::{PathSegment, Value};

/// Result type for board operations
pub type Result<T> = std::result::Result<T, BoardError>;
