use crate::decision::DecisionNode;
use crate::io::{EndNode, InputNode, OutputNode, StartNode};
use crate::transform::TransformNode;
use async_trait::async_trait;
use boardcore::{InvocationHandle, NodeContext, NodeError, NodeExecutor, NodeKind, NodeOutput};
use std::sync::Arc;

/// Reference executor for every node kind.
///
/// Structural kinds run in-process. Agent calls and loop bodies are passed to
/// the delegate; without one they fail with `NodeError::Unsupported`.
#[derive(Clone, Default)]
pub struct BuiltinExecutor {
    delegate: Option<Arc<dyn NodeExecutor>>,
}

impl BuiltinExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor for agent calls and loop bodies.
    pub fn with_delegate(mut self, delegate: Arc<dyn NodeExecutor>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    async fn delegate(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        match &self.delegate {
            Some(delegate) => delegate.execute(ctx).await,
            None => Err(NodeError::Unsupported(format!(
                "no executor configured for {} nodes",
                ctx.node.kind.type_name()
            ))),
        }
    }
}

#[async_trait]
impl NodeExecutor for BuiltinExecutor {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if ctx.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let node = ctx.node.clone();
        tracing::debug!(
            execution_id = %ctx.handle.execution_id,
            node_id = %node.id,
            "Executing {} node {}",
            node.kind.type_name(),
            node.label()
        );

        match &node.kind {
            NodeKind::Start => StartNode.run(&ctx),
            NodeKind::End => EndNode.run(&ctx),
            NodeKind::Input { fields } => InputNode { fields }.run(&ctx),
            NodeKind::Output { fields } => OutputNode { fields }.run(&ctx),
            NodeKind::Transform { mappings } => TransformNode { mappings }.run(&ctx),
            NodeKind::Decision { expression } => DecisionNode { expression }.run(&ctx),
            NodeKind::AgentCall { .. } | NodeKind::Loop { .. } => self.delegate(ctx).await,
        }
    }

    async fn cancel(&self, handle: InvocationHandle) {
        if let Some(delegate) = &self.delegate {
            delegate.cancel(handle).await;
        }
    }
}
