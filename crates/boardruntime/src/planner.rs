use crate::graph::BoardGraph;
use crate::validator::find_cycle;
use boardcore::{Board, NodeId, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Set of nodes with no dependency between any two members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub index: usize,
    pub nodes: Vec<NodeId>,
}

/// Ordered stages for one board snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Stage>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// All planned nodes in plan order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.stages.iter().flat_map(|s| s.nodes.iter().copied())
    }

    /// Stage contents only, handy for comparisons.
    #[cfg(test)]
    pub fn as_lists(&self) -> Vec<Vec<NodeId>> {
        self.stages.iter().map(|s| s.nodes.clone()).collect()
    }
}

/// Stage a board by topological level.
pub fn plan(board: &Board) -> Result<ExecutionPlan, ValidationError> {
    let graph = BoardGraph::new(board);
    plan_graph(board, &graph)
}

/// Kahn's algorithm over the active subgraph, one level per stage.
///
/// Within a stage, nodes with an `execution_order` hint come first in
/// ascending hint order; the rest keep board definition order.
pub fn plan_graph(board: &Board, graph: &BoardGraph) -> Result<ExecutionPlan, ValidationError> {
    let hints: HashMap<NodeId, Option<i64>> = board
        .nodes
        .iter()
        .map(|n| (n.id, n.execution_order))
        .collect();
    let sort_key = |id: &NodeId| {
        let hint = hints.get(id).copied().flatten();
        (hint.is_none(), hint, graph.position(*id).unwrap_or(usize::MAX))
    };

    let mut in_degree: HashMap<NodeId, usize> = graph
        .node_ids()
        .iter()
        .map(|id| (*id, graph.in_degree(*id)))
        .collect();

    let mut current: Vec<NodeId> = graph
        .node_ids()
        .iter()
        .copied()
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    current.sort_by_key(&sort_key);

    let mut stages = Vec::new();
    let mut placed = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for node in &current {
            for succ in graph.successors(*node) {
                if let Some(deg) = in_degree.get_mut(&succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        next.push(succ);
                    }
                }
            }
        }
        next.sort_by_key(&sort_key);

        placed += current.len();
        stages.push(Stage {
            index: stages.len(),
            nodes: std::mem::replace(&mut current, next),
        });
    }

    if placed < graph.node_count() {
        let path = find_cycle(graph).unwrap_or_default();
        return Err(ValidationError::Cycle { path });
    }

    tracing::debug!(
        "Planned board {} into {} stage(s) over {} node(s)",
        board.id,
        stages.len(),
        placed
    );

    Ok(ExecutionPlan { stages })
}
