//! Built-in node behaviour
//!
//! `BuiltinExecutor` implements the structural node kinds (start, end,
//! input, output, transform and decision) and hands agent calls and loop
//! bodies to a delegate executor.

mod builtin;
mod decision;
mod io;
mod transform;

pub use builtin::BuiltinExecutor;
pub use decision::DecisionNode;
pub use io::{EndNode, InputNode, OutputNode, StartNode};
pub use transform::TransformNode;

use boardcore::{NodeContext, Value};

/// Scope a node's expressions and mappings resolve against: the run context
/// plus `inputs` (live predecessor outputs by node id), `input` (the sole
/// predecessor output, when there is exactly one) and `config`.
pub(crate) fn node_scope(ctx: &NodeContext) -> Value {
    let inputs: Value = ctx.inputs.clone().into();
    let input = if ctx.inputs.len() == 1 {
        ctx.inputs.values().next().cloned().unwrap_or_default()
    } else {
        Value::Null
    };
    ctx.context
        .as_ref()
        .clone()
        .with("inputs", inputs)
        .with("input", input)
        .with("config", ctx.node.config.clone())
}
