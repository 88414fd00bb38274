use crate::{events::EventEmitter, ExecutionId, NodeError, NodeId, NodeSpec, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The capability that performs a node's actual work. Injected into the
/// engine; agent calls, transforms and the like live behind it.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute one invocation of a node
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Ask an in-flight invocation to stop. The invocation's cancellation
    /// token is triggered as well, so executors that watch it need not
    /// override this.
    async fn cancel(&self, _handle: InvocationHandle) {}
}

/// Identifies one invocation so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationHandle {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
}

/// Iteration state handed to loop node invocations.
#[derive(Debug, Clone)]
pub struct LoopIteration {
    pub index: u32,
    pub max_iterations: u32,
    pub previous: Option<Value>,
}

/// Execution context passed to each node invocation
#[derive(Clone)]
pub struct NodeContext {
    pub handle: InvocationHandle,

    /// The node being executed, from the run's board snapshot.
    pub node: Arc<NodeSpec>,

    /// Outputs of predecessors that reached this node over a live
    /// connection, keyed by predecessor node id.
    pub inputs: BTreeMap<String, Value>,

    /// Read-only snapshot of the run context: `trigger`, `execution_type`
    /// and every resolved node output keyed by node id.
    pub context: Arc<Value>,

    pub iteration: Option<LoopIteration>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Triggered when the run is cancelled or times out
    pub cancellation: CancellationToken,
}

impl NodeContext {
    /// Context with no inputs and an empty run scope, for executor tests and
    /// ad-hoc invocations.
    pub fn standalone(execution_id: ExecutionId, node: NodeSpec) -> Self {
        let node_id = node.id;
        Self {
            handle: InvocationHandle {
                execution_id,
                node_id,
            },
            node: Arc::new(node),
            inputs: BTreeMap::new(),
            context: Arc::new(Value::object()),
            iteration: None,
            events: EventEmitter::detached(execution_id, node_id),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.node.config.get(name).cloned().unwrap_or(default)
    }

    /// Trigger data submitted with the run.
    pub fn trigger(&self) -> &Value {
        self.context.get("trigger").unwrap_or(&Value::Null)
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: BTreeMap<String, Value>,

    /// Execution metadata
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    /// Ports as an object value, the shape stored in the run context.
    pub fn to_value(&self) -> Value {
        Value::Object(self.outputs.clone())
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
}
