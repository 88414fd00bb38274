use boardcore::{Board, Connection, NodeId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// Dependency graph over a board's active nodes and active connections.
///
/// Node weights are node ids; edge weights are indices into
/// `board.connections`. Connections touching an inactive or unknown node are
/// left out.
#[derive(Debug, Clone)]
pub struct BoardGraph {
    graph: DiGraph<NodeId, usize>,
    index: HashMap<NodeId, NodeIndex>,
    /// Position of each active node in the board's definition order
    positions: HashMap<NodeId, usize>,
    /// Active node ids in definition order
    order: Vec<NodeId>,
}

impl BoardGraph {
    pub fn new(board: &Board) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut positions = HashMap::new();
        let mut order = Vec::new();

        for (pos, node) in board.nodes.iter().enumerate() {
            if !node.active || index.contains_key(&node.id) {
                continue;
            }
            let idx = graph.add_node(node.id);
            index.insert(node.id, idx);
            positions.insert(node.id, pos);
            order.push(node.id);
        }

        for (conn_idx, conn) in board.connections.iter().enumerate() {
            if !conn.active {
                continue;
            }
            let (Some(from), Some(to)) = (
                index.get(&conn.source_node_id),
                index.get(&conn.target_node_id),
            ) else {
                continue;
            };
            graph.add_edge(*from, *to, conn_idx);
        }

        Self {
            graph,
            index,
            positions,
            order,
        }
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Active node ids in definition order
    pub fn node_ids(&self) -> &[NodeId] {
        &self.order
    }

    #[cfg(test)]
    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Indices into `board.connections` of active inbound connections,
    /// in definition order.
    pub fn incoming(&self, id: NodeId) -> Vec<usize> {
        let Some(idx) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut edges: Vec<usize> = self
            .graph
            .edges_directed(*idx, Direction::Incoming)
            .map(|e| *e.weight())
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Distinct successors of a node, in connection definition order.
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Distinct predecessors of a node, in connection definition order.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: NodeId, dir: Direction) -> Vec<NodeId> {
        let Some(idx) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut edges: Vec<(usize, NodeId)> = self
            .graph
            .edges_directed(*idx, dir)
            .map(|e| {
                let other = match dir {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                (*e.weight(), self.graph[other])
            })
            .collect();
        edges.sort_unstable_by_key(|(conn_idx, _)| *conn_idx);

        let mut seen = Vec::with_capacity(edges.len());
        for (_, node) in edges {
            if !seen.contains(&node) {
                seen.push(node);
            }
        }
        seen
    }

    pub fn in_degree(&self, id: NodeId) -> usize {
        self.predecessors(id).len()
    }

    /// Whether `to` can be reached from `from` along active edges.
    #[cfg(test)]
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        match (self.index.get(&from), self.index.get(&to)) {
            (Some(a), Some(b)) => petgraph::algo::has_path_connecting(&self.graph, *a, *b, None),
            _ => false,
        }
    }

    /// Underlying petgraph structure
    pub fn inner(&self) -> &DiGraph<NodeId, usize> {
        &self.graph
    }

    pub fn node_index(&self, id: NodeId) -> Option<NodeIndex> {
        self.index.get(&id).copied()
    }
}

/// Inbound connections of a node ordered by explicit hint, then definition order.
pub(crate) fn ordered_inbound<'a>(
    board: &'a Board,
    graph: &BoardGraph,
    id: NodeId,
) -> Vec<&'a Connection> {
    let mut conns: Vec<(usize, &Connection)> = graph
        .incoming(id)
        .into_iter()
        .filter_map(|i| board.connections.get(i).map(|c| (i, c)))
        .collect();
    conns.sort_by_key(|(i, c)| (c.execution_order.is_none(), c.execution_order, *i));
    conns.into_iter().map(|(_, c)| c).collect()
}
