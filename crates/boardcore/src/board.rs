use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type BoardId = Uuid;
pub type NodeId = Uuid;
pub type ConnectionId = Uuid;

/// Workflow board: a directed graph of typed nodes joined by conditional
/// connections. Visual layout lives elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub execution_count: u64,
}

impl Board {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            executable: false,
            execution_count: 0,
        }
    }

    /// Add a node, stamping it with this board's id.
    pub fn add_node(&mut self, mut node: NodeSpec) -> NodeId {
        node.board_id = self.id;
        let id = node.id;
        self.nodes.push(node);
        id
    }

    /// Add an unconditional connection.
    pub fn connect(&mut self, source: NodeId, target: NodeId) -> ConnectionId {
        self.add_connection(Connection::new(source, target))
    }

    /// Add a connection gated by a condition expression.
    pub fn connect_when(
        &mut self,
        source: NodeId,
        target: NodeId,
        condition: impl Into<String>,
    ) -> ConnectionId {
        self.add_connection(Connection::new(source, target).with_condition(condition))
    }

    pub fn add_connection(&mut self, mut connection: Connection) -> ConnectionId {
        connection.board_id = self.id;
        let id = connection.id;
        self.connections.push(connection);
        id
    }

    pub fn find_node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_mut(&mut self, id: NodeId) -> Option<&mut NodeSpec> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn find_connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.active)
    }
}

/// Closed set of node types, each with its own configuration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    End,
    AgentCall {
        agent_id: String,
        #[serde(default)]
        prompt: Option<String>,
    },
    Decision {
        expression: String,
    },
    Transform {
        /// Output port -> dotted path into the run context.
        #[serde(default)]
        mappings: BTreeMap<String, String>,
    },
    Input {
        #[serde(default)]
        fields: Vec<String>,
    },
    Output {
        #[serde(default)]
        fields: Vec<String>,
    },
    /// Bounded iteration. The body is whatever the executor does for this node.
    Loop {
        max_iterations: u32,
        #[serde(default)]
        until: Option<String>,
    },
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::AgentCall { .. } => "agent_call",
            NodeKind::Decision { .. } => "decision",
            NodeKind::Transform { .. } => "transform",
            NodeKind::Input { .. } => "input",
            NodeKind::Output { .. } => "output",
            NodeKind::Loop { .. } => "loop",
        }
    }
}

/// Node specification in a board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(default)]
    pub board_id: BoardId,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub input_schema: Option<PortSchema>,
    #[serde(default)]
    pub output_schema: Option<PortSchema>,
    #[serde(default)]
    pub is_start: bool,
    #[serde(default)]
    pub is_end: bool,
    #[serde(default)]
    pub execution_order: Option<i64>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub critical: bool,
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    /// New active node. `Start` and `End` kinds get the matching flag set.
    pub fn new(kind: NodeKind) -> Self {
        let is_start = matches!(kind, NodeKind::Start);
        let is_end = matches!(kind, NodeKind::End);
        Self {
            id: Uuid::new_v4(),
            board_id: Uuid::nil(),
            name: None,
            kind,
            config: Value::Null,
            input_schema: None,
            output_schema: None,
            is_start,
            is_end,
            execution_order: None,
            active: true,
            critical: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key, value);
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.execution_order = Some(order);
        self
    }

    pub fn with_input_schema(mut self, schema: PortSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: PortSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn end(mut self) -> Self {
        self.is_end = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Human-readable label for logs.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.kind.type_name(), self.id),
        }
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    #[serde(default)]
    pub board_id: BoardId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    #[serde(default)]
    pub condition: Option<String>,
    /// Exposed to the condition expression as `config`.
    #[serde(default)]
    pub condition_config: Value,
    #[serde(default)]
    pub execution_order: Option<i64>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Connection {
    pub fn new(source: NodeId, target: NodeId) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id: Uuid::nil(),
            source_node_id: source,
            target_node_id: target,
            condition: None,
            condition_config: Value::Null,
            execution_order: None,
            active: true,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_condition_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition_config.insert(key, value);
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.execution_order = Some(order);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Declared shape of a node's input or output ports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSchema {
    pub fields: BTreeMap<String, ValueType>,
}

impl PortSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Any,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    /// Whether a value of type `produced` can feed a port expecting `self`.
    pub fn accepts(self, produced: ValueType) -> bool {
        self == ValueType::Any || produced == ValueType::Any || self == produced
    }
}
