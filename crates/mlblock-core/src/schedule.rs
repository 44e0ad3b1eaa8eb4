use crate::graph::{Graph, NodeId};
use crate::{MlbError, Result};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct Schedule {
    /// Nodes in an order where dependencies appear before dependents.
    pub order: Vec<NodeId>,
    /// The requested output nodes (subset of `order`).
    pub outputs: Vec<NodeId>,
}

impl Schedule {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.order.binary_search(&id).is_ok()
    }

    /// Position of `id` in the execution order.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.binary_search(&id).ok()
    }
}

/// Compute the execution order for the subgraph required to produce `outputs`.
///
/// - Only includes nodes reachable from outputs.
/// - Node ids are creation indices and an op can only reference earlier
///   nodes, so sorting the reachable set by id is a topological order.
/// - A node reading a later node means the arena was corrupted; that is
///   reported rather than scheduled.
pub fn schedule(graph: &Graph, outputs: &[NodeId]) -> Result<Schedule> {
    let mut reachable: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = outputs.to_vec();

    while let Some(nid) = stack.pop() {
        if !reachable.insert(nid) {
            continue;
        }
        let node = graph.node(nid)?;
        for &inp in node.inputs.iter() {
            if inp >= nid {
                return Err(MlbError::Graph("node reads a value created after it"));
            }
            stack.push(inp);
        }
    }

    let mut order: Vec<NodeId> = reachable.into_iter().collect();
    order.sort_unstable();

    Ok(Schedule {
        order,
        outputs: outputs.to_vec(),
    })
}
