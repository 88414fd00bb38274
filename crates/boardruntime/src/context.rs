use boardcore::{Connection, NodeId, Value};
use std::collections::BTreeMap;

/// Accumulated state of one run: trigger data plus the output of every node
/// that has succeeded so far. Owned by a single engine; never shared across runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    execution_type: String,
    trigger: Value,
    outputs: BTreeMap<NodeId, Value>,
    names: BTreeMap<NodeId, String>,
}

impl RunContext {
    pub fn new(execution_type: impl Into<String>, trigger: Value) -> Self {
        Self {
            execution_type: execution_type.into(),
            trigger,
            outputs: BTreeMap::new(),
            names: BTreeMap::new(),
        }
    }

    /// Record a node's output under its id, and under its name in `nodes`.
    pub fn merge(&mut self, node_id: NodeId, name: Option<&str>, output: Value) {
        if let Some(name) = name {
            self.names.insert(node_id, name.to_string());
        }
        self.outputs.insert(node_id, output);
    }

    pub fn output(&self, node_id: NodeId) -> Option<&Value> {
        self.outputs.get(&node_id)
    }

    pub fn outputs(&self) -> &BTreeMap<NodeId, Value> {
        &self.outputs
    }

    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    /// The whole context as a value:
    /// `{ "<node-id>": output, "nodes": { "<name>": output }, "trigger": .., "execution_type": .. }`
    pub fn to_value(&self) -> Value {
        let mut root = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        for (id, output) in &self.outputs {
            root.insert(id.to_string(), output.clone());
            if let Some(name) = self.names.get(id) {
                by_name.insert(name.clone(), output.clone());
            }
        }
        root.insert("nodes".to_string(), Value::Object(by_name));
        root.insert("trigger".to_string(), self.trigger.clone());
        root.insert(
            "execution_type".to_string(),
            Value::String(self.execution_type.clone()),
        );
        Value::Object(root)
    }

    /// Scope a connection's condition is evaluated in: the whole context plus
    /// `output` (the source node's output) and `config` (the connection's
    /// `condition_config`).
    pub fn scope_for(&self, connection: &Connection) -> Value {
        let mut scope = self.to_value();
        let source_output = self
            .outputs
            .get(&connection.source_node_id)
            .cloned()
            .unwrap_or(Value::Null);
        scope.insert("output", source_output);
        scope.insert("config", connection.condition_config.clone());
        scope
    }
}
