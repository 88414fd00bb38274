use boardcore::{NodeContext, NodeError, NodeOutput, Value};
use std::collections::BTreeMap;

/// Entry point of a board. Publishes the trigger data.
pub struct StartNode;

impl StartNode {
    pub fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new().with_output("trigger", ctx.trigger().clone()))
    }
}

/// Exit point of a board. Collects whatever reached it.
pub struct EndNode;

impl EndNode {
    pub fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new().with_output("result", ctx.inputs.clone()))
    }
}

/// Pulls named fields out of the trigger data.
///
/// With no fields declared the whole trigger is published as `data`.
/// A declared field missing from the trigger is an error.
pub struct InputNode<'a> {
    pub fields: &'a [String],
}

impl InputNode<'_> {
    pub fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        let trigger = ctx.trigger();
        if self.fields.is_empty() {
            return Ok(NodeOutput::new().with_output("data", trigger.clone()));
        }

        let mut output = NodeOutput::new();
        for field in self.fields {
            let value = trigger
                .lookup_dotted(field)
                .ok_or_else(|| NodeError::MissingInput(field.clone()))?;
            output = output.with_output(field.as_str(), value.clone());
        }
        Ok(output)
    }
}

/// Publishes selected values as the board's result.
///
/// Each field is looked up in the predecessor outputs first and then as a
/// dotted path into the run context. Unresolved fields are `null`.
/// Every published field is also streamed as a data event on its own port.
pub struct OutputNode<'a> {
    pub fields: &'a [String],
}

impl OutputNode<'_> {
    pub fn run(&self, ctx: &NodeContext) -> Result<NodeOutput, NodeError> {
        if self.fields.is_empty() {
            return Ok(NodeOutput::new().with_output("result", ctx.inputs.clone()));
        }

        let mut result = BTreeMap::new();
        for field in self.fields {
            let value = ctx
                .inputs
                .values()
                .find_map(|input| input.lookup_dotted(field))
                .or_else(|| ctx.context.lookup_dotted(field))
                .cloned()
                .unwrap_or(Value::Null);
            ctx.events.data(field.as_str(), value.clone());
            result.insert(field.clone(), value);
        }
        Ok(NodeOutput::new().with_output("result", result))
    }
}
