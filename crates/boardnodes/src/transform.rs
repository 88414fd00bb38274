use crate::node_scope;
use boardcore::{NodeContext, NodeError, NodeOutput, Value};
use std::collections::BTreeMap;

/// Maps values from the node scope onto output ports.
///
/// Each mapping is `port -> dotted path`, e.g. `"label" -> "input.category"`
/// or `"user" -> "trigger.user.name"`. A path that does not resolve fails the
/// node unless the node config sets `allow_missing: true`, in which case the
/// port is `null`.
pub struct TransformNode<'a> {
    pub mappings: &'a BTreeMap<String, String>,
}

impl TransformNode<'_> {
    pub fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let scope = node_scope(ctx);
        let allow_missing = ctx
            .get_config_or("allow_missing", Value::Bool(false))
            .as_bool()
            .unwrap_or(false);

        let mut output = NodeOutput::new();
        for (port, path) in self.mappings {
            match scope.lookup_dotted(path) {
                Some(value) => {
                    output = output.with_output(port.as_str(), value.clone());
                }
                None if allow_missing => {
                    ctx.events.warn(format!("'{}' resolved to nothing", path));
                    output = output.with_output(port.as_str(), Value::Null);
                }
                None => return Err(NodeError::MissingInput(path.clone())),
            }
        }

        tracing::debug!(
            node_id = %ctx.node_id(),
            "Transform mapped {} port(s)",
            output.outputs.len()
        );
        Ok(output)
    }
}
