//! Board execution runtime
//!
//! Validation, stage planning, condition evaluation and the engine that
//! drives one run of a board snapshot through its stages.

pub mod condition;
mod context;
mod engine;
mod graph;
pub mod planner;
mod runtime;
pub mod store;
pub mod validator;

pub use condition::{Condition, ConditionEvaluator};
pub use context::RunContext;
pub use engine::ExecutionEngine;
pub use graph::BoardGraph;
pub use planner::{plan, ExecutionPlan, Stage};
pub use runtime::{BoardRuntime, ExecutionHandle, RuntimeConfig};
pub use store::{BoardRepository, ExecutionStore, InMemoryBoardRepository, InMemoryExecutionStore};
pub use validator::{mark_executable, validate, ValidationReport, ValidationWarning, Validator};
