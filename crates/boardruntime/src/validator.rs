//! Board validation
//!
//! Checks, in order:
//! 1. node ids are unique and every node and connection belongs to the board
//! 2. every connection references existing nodes
//! 3. at least one active start node and one active end node exist
//! 4. the active subgraph is acyclic
//! 5. every active non-start node is reachable from a start node
//! 6. loop nodes declare a bounded iteration count
//!
//! Condition syntax and port schema compatibility are reported as warnings
//! (schema mismatches become errors in strict mode).

use crate::condition::Condition;
use crate::graph::BoardGraph;
use boardcore::{Board, ConnectionId, NodeId, NodeKind, ValidationError};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub board_id: Uuid,
    pub active_nodes: usize,
    pub active_connections: usize,
    pub start_nodes: Vec<NodeId>,
    pub end_nodes: Vec<NodeId>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    /// Active connection whose source or target node is inactive.
    InactiveEndpoint { connection: ConnectionId },
    /// Condition that will never parse; the connection is always unsatisfied.
    InvalidCondition {
        connection: ConnectionId,
        message: String,
    },
    SchemaMismatch {
        connection: ConnectionId,
        message: String,
    },
}

/// Structural validator for boards. Pure: validating an unchanged board
/// twice yields identical reports.
#[derive(Debug, Clone)]
pub struct Validator {
    strict_schemas: bool,
    max_loop_iterations: u32,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            strict_schemas: false,
            max_loop_iterations: 1000,
        }
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat schema mismatches as errors instead of warnings.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_schemas = strict;
        self
    }

    pub fn max_loop_iterations(mut self, limit: u32) -> Self {
        self.max_loop_iterations = limit;
        self
    }

    pub fn validate(&self, board: &Board) -> Result<ValidationReport, ValidationError> {
        tracing::debug!(
            "Validating board {} ({} nodes, {} connections)",
            board.id,
            board.nodes.len(),
            board.connections.len()
        );

        let mut warnings = Vec::new();

        // Referential integrity
        let mut known: HashMap<NodeId, bool> = HashMap::new();
        for node in &board.nodes {
            if known.insert(node.id, node.active).is_some() {
                return Err(ValidationError::DuplicateNode(node.id));
            }
            if !node.board_id.is_nil() && node.board_id != board.id {
                return Err(ValidationError::ForeignNode {
                    node: node.id,
                    expected: board.id,
                    found: node.board_id,
                });
            }
        }

        for conn in &board.connections {
            if !conn.board_id.is_nil() && conn.board_id != board.id {
                return Err(ValidationError::ForeignConnection {
                    connection: conn.id,
                    expected: board.id,
                    found: conn.board_id,
                });
            }
            for endpoint in [conn.source_node_id, conn.target_node_id] {
                match known.get(&endpoint) {
                    None => {
                        return Err(ValidationError::UnknownNode {
                            connection: conn.id,
                            node: endpoint,
                        })
                    }
                    Some(false) if conn.active => {
                        let warning = ValidationWarning::InactiveEndpoint { connection: conn.id };
                        if !warnings.contains(&warning) {
                            warnings.push(warning);
                        }
                    }
                    Some(_) => {}
                }
            }
        }

        // Start and end nodes
        let start_nodes: Vec<NodeId> = board
            .active_nodes()
            .filter(|n| n.is_start)
            .map(|n| n.id)
            .collect();
        if start_nodes.is_empty() {
            return Err(ValidationError::MissingStartNode);
        }
        let end_nodes: Vec<NodeId> = board
            .active_nodes()
            .filter(|n| n.is_end)
            .map(|n| n.id)
            .collect();
        if end_nodes.is_empty() {
            return Err(ValidationError::MissingEndNode);
        }

        let graph = BoardGraph::new(board);

        if let Some(path) = find_cycle(&graph) {
            tracing::debug!("Board {} contains a cycle of {} nodes", board.id, path.len() - 1);
            return Err(ValidationError::Cycle { path });
        }

        let unreachable = unreachable_nodes(board, &graph, &start_nodes);
        if !unreachable.is_empty() {
            return Err(ValidationError::Unreachable { nodes: unreachable });
        }

        for node in board.active_nodes() {
            if let NodeKind::Loop { max_iterations, .. } = node.kind {
                if max_iterations == 0 || max_iterations > self.max_loop_iterations {
                    return Err(ValidationError::UnboundedLoop {
                        node: node.id,
                        max_iterations,
                        limit: self.max_loop_iterations,
                    });
                }
            }
        }

        for conn_idx in graph.inner().edge_weights() {
            let Some(conn) = board.connections.get(*conn_idx) else {
                continue;
            };
            if let Some(cond) = conn.condition.as_deref().filter(|c| !c.trim().is_empty()) {
                if let Err(e) = Condition::parse(cond) {
                    warnings.push(ValidationWarning::InvalidCondition {
                        connection: conn.id,
                        message: e.to_string(),
                    });
                }
            }
        }

        for (connection, message) in schema_mismatches(board, &graph) {
            if self.strict_schemas {
                return Err(ValidationError::SchemaMismatch { connection, message });
            }
            warnings.push(ValidationWarning::SchemaMismatch { connection, message });
        }

        tracing::debug!(
            "Board {} validated with {} warning(s)",
            board.id,
            warnings.len()
        );

        Ok(ValidationReport {
            board_id: board.id,
            active_nodes: graph.node_count(),
            active_connections: graph.edge_count(),
            start_nodes,
            end_nodes,
            warnings,
        })
    }
}

/// Validate with default settings.
pub fn validate(board: &Board) -> Result<ValidationReport, ValidationError> {
    Validator::default().validate(board)
}

/// Validate `board` and set its `executable` flag only if validation passes.
pub fn mark_executable(
    board: &mut Board,
    validator: &Validator,
) -> Result<ValidationReport, ValidationError> {
    match validator.validate(board) {
        Ok(report) => {
            board.executable = true;
            Ok(report)
        }
        Err(e) => {
            board.executable = false;
            Err(e)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Three-color depth-first search. Returns the first cycle found as a node
/// sequence that starts and ends with the same node.
pub(crate) fn find_cycle(graph: &BoardGraph) -> Option<Vec<NodeId>> {
    let mut marks: HashMap<NodeId, Mark> = graph
        .node_ids()
        .iter()
        .map(|id| (*id, Mark::Unvisited))
        .collect();

    for root in graph.node_ids() {
        if marks.get(root) != Some(&Mark::Unvisited) {
            continue;
        }

        // (node, successors, next successor to visit)
        let mut stack: Vec<(NodeId, Vec<NodeId>, usize)> = vec![(*root, graph.successors(*root), 0)];
        marks.insert(*root, Mark::InProgress);

        while let Some((node, successors, next)) = stack.last_mut() {
            if *next >= successors.len() {
                marks.insert(*node, Mark::Done);
                stack.pop();
                continue;
            }
            let child = successors[*next];
            *next += 1;

            match marks.get(&child).copied().unwrap_or(Mark::Done) {
                Mark::Unvisited => {
                    marks.insert(child, Mark::InProgress);
                    let grandchildren = graph.successors(child);
                    stack.push((child, grandchildren, 0));
                }
                Mark::InProgress => {
                    let start = stack.iter().position(|(n, _, _)| *n == child).unwrap_or(0);
                    let mut path: Vec<NodeId> = stack[start..].iter().map(|(n, _, _)| *n).collect();
                    path.push(child);
                    return Some(path);
                }
                Mark::Done => {}
            }
        }
    }

    None
}

fn unreachable_nodes(board: &Board, graph: &BoardGraph, starts: &[NodeId]) -> Vec<NodeId> {
    let inner = graph.inner();
    let mut reached = HashSet::new();
    let mut dfs = Dfs::empty(inner);
    for start in starts {
        if let Some(idx) = graph.node_index(*start) {
            dfs.move_to(idx);
            while let Some(nx) = dfs.next(inner) {
                reached.insert(inner[nx]);
            }
        }
    }

    board
        .active_nodes()
        .filter(|n| !n.is_start && !reached.contains(&n.id))
        .map(|n| n.id)
        .collect()
}

fn schema_mismatches(board: &Board, graph: &BoardGraph) -> Vec<(ConnectionId, String)> {
    let mut mismatches = Vec::new();

    for conn_idx in graph.inner().edge_weights() {
        let Some(conn) = board.connections.get(*conn_idx) else {
            continue;
        };
        let (Some(source), Some(target)) = (
            board.find_node(conn.source_node_id),
            board.find_node(conn.target_node_id),
        ) else {
            continue;
        };
        let (Some(produced), Some(expected)) = (&source.output_schema, &target.input_schema) else {
            continue;
        };

        for (field, want) in &expected.fields {
            match produced.fields.get(field) {
                None => mismatches.push((
                    conn.id,
                    format!("{} does not produce field '{}'", source.label(), field),
                )),
                Some(got) if !want.accepts(*got) => mismatches.push((
                    conn.id,
                    format!(
                        "field '{}' is {:?} from {} but {} expects {:?}",
                        field,
                        got,
                        source.label(),
                        target.label(),
                        want
                    ),
                )),
                Some(_) => {}
            }
        }
    }

    mismatches
}
