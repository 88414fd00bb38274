use crate::node_scope;
use boardcore::{NodeContext, NodeError, NodeOutput};
use boardruntime::Condition;

/// Evaluates a condition expression and publishes the verdict.
///
/// Outputs `result` (bool) and `branch` (`"true"` or `"false"`), so outgoing
/// connections can gate on `output.result`. The expression sees the same
/// scope as a transform: run context, `inputs`, `input` and `config`.
pub struct DecisionNode<'a> {
    pub expression: &'a str,
}

impl DecisionNode<'_> {
    pub fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let condition = Condition::parse(self.expression)
            .map_err(|e| NodeError::InvalidConfig(e.to_string()))?;

        let verdict = condition
            .evaluate(&node_scope(ctx))
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;

        ctx.events.info(format!("'{}' is {}", self.expression, verdict));
        Ok(NodeOutput::new()
            .with_output("result", verdict)
            .with_output("branch", if verdict { "true" } else { "false" }))
    }
}
