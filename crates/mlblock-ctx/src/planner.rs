//! Backend partition and buffer plan for a sealed graph.

use std::collections::HashMap;

use tracing::debug;

use mlblock_core::alloc::{AllocHint, GraphPlan, plan_graph};
use mlblock_core::schedule::{Schedule, schedule};
use mlblock_core::{Graph, MlbError, NodeId, Result};

/// Everything the executor needs for one sealed graph.
#[derive(Debug, Clone)]
pub struct Planned {
    pub schedule: Schedule,
    /// Segment of every scheduled node, parallel to `schedule.order`.
    pub segments: Vec<usize>,
    /// Backend of every scheduled node, parallel to `schedule.order`.
    pub assignment: Vec<usize>,
    pub plan: GraphPlan,
}

impl Planned {
    pub fn result(&self) -> Option<NodeId> {
        self.schedule.outputs.first().copied()
    }

    pub fn segment_of(&self, node: NodeId) -> Option<usize> {
        self.schedule.position(node).map(|i| self.segments[i])
    }

    pub fn backend_of(&self, node: NodeId) -> Option<usize> {
        self.schedule.position(node).map(|i| self.assignment[i])
    }
}

/// Segment of every node in `sched.order`.
///
/// Markers must be scheduled op nodes in strictly increasing order. An op
/// belongs to the segment counting the markers before it, so a marker closes
/// its segment. A leaf joins the segment of its first consumer.
pub fn partition(graph: &Graph, sched: &Schedule, markers: &[NodeId]) -> Result<Vec<usize>> {
    for (i, &m) in markers.iter().enumerate() {
        if !sched.contains(m) {
            return Err(MlbError::usage(format!(
                "split marker {m} is not part of the graph"
            )));
        }
        if graph.node(m)?.is_leaf() {
            return Err(MlbError::usage(format!(
                "split marker {m} is a leaf; splits follow an op"
            )));
        }
        if i > 0 && markers[i - 1] >= m {
            return Err(MlbError::usage(format!(
                "split marker {m} does not follow the previous marker {}",
                markers[i - 1]
            )));
        }
    }

    let mut segments = vec![0usize; sched.len()];
    let mut leaf_segment: HashMap<NodeId, usize> = HashMap::new();
    for (pos, &id) in sched.order.iter().enumerate() {
        let node = graph.node(id)?;
        if node.is_leaf() {
            continue;
        }
        let seg = markers.partition_point(|&m| m < id);
        segments[pos] = seg;
        for &inp in node.inputs.iter() {
            leaf_segment.entry(inp).or_insert(seg);
        }
    }
    for (pos, &id) in sched.order.iter().enumerate() {
        if graph.node(id)?.is_leaf() {
            segments[pos] = leaf_segment.get(&id).copied().unwrap_or(0);
        }
    }
    Ok(segments)
}

/// Schedule, partition and plan the graph rooted at `result`.
pub fn plan(
    graph: &Graph,
    result: NodeId,
    markers: &[NodeId],
    n_backends: usize,
    hint: AllocHint,
) -> Result<Planned> {
    let schedule = schedule(graph, &[result])?;
    let segments = partition(graph, &schedule, markers)?;
    let assignment: Vec<usize> = segments.iter().map(|s| s % n_backends.max(1)).collect();
    let plan = plan_graph(graph, &schedule, &assignment, n_backends, hint)?;
    debug!(
        nodes = schedule.len(),
        segments = markers.len() + 1,
        params = ?plan.param_sizes,
        compute = ?plan.compute_sizes,
        copies = plan.n_copies(),
        "planned graph"
    );
    Ok(Planned {
        schedule,
        segments,
        assignment,
        plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlblock_core::{DType, LeafKind, Shape, Tensor};
    use proptest::prelude::*;

    fn chain(g: &mut Graph, n: usize) -> (Tensor, Vec<Tensor>) {
        let s = Shape::from([2]);
        let x = g.new_leaf(LeafKind::Input, "x", DType::F32, &s).unwrap();
        let mut t = x.clone();
        let mut ops = Vec::new();
        for i in 0..n {
            let w = g
                .new_leaf(LeafKind::Param, &format!("w{i}"), DType::F32, &s)
                .unwrap();
            t = g.add(&t, &w).unwrap();
            ops.push(t.clone());
        }
        (x, ops)
    }

    #[test]
    fn test_no_markers_single_segment() {
        let mut g = Graph::new();
        let (_, ops) = chain(&mut g, 3);
        let p = plan(&g, ops[2].node_id(), &[], 2, AllocHint::default()).unwrap();
        assert!(p.segments.iter().all(|&s| s == 0));
        assert!(p.assignment.iter().all(|&b| b == 0));
        assert_eq!(p.plan.n_copies(), 0);
    }

    #[test]
    fn test_marker_closes_its_segment() {
        let mut g = Graph::new();
        let (x, ops) = chain(&mut g, 3);
        let p = plan(&g, ops[2].node_id(), &[ops[0].node_id()], 2, AllocHint::default()).unwrap();
        assert_eq!(p.segment_of(ops[0].node_id()), Some(0));
        assert_eq!(p.segment_of(x.node_id()), Some(0));
        assert_eq!(p.segment_of(ops[1].node_id()), Some(1));
        assert_eq!(p.backend_of(ops[2].node_id()), Some(1));
        // ops[0] crosses from backend 0 to backend 1.
        assert_eq!(p.plan.n_copies(), 1);
    }

    #[test]
    fn test_bad_markers() {
        let mut g = Graph::new();
        let (x, ops) = chain(&mut g, 3);
        let res = ops[1].node_id();
        let unreachable = ops[2].node_id();
        let err = |m: &[NodeId]| plan(&g, res, m, 2, AllocHint::default()).unwrap_err();
        assert!(matches!(err(&[unreachable]), MlbError::Usage(_)));
        assert!(matches!(err(&[x.node_id()]), MlbError::Usage(_)));
        assert!(matches!(err(&[ops[1].node_id(), ops[0].node_id()]), MlbError::Usage(_)));
        assert!(matches!(err(&[ops[0].node_id(), ops[0].node_id()]), MlbError::Usage(_)));
    }

    proptest! {
        #[test]
        fn prop_every_node_in_exactly_one_segment(
            n in 1usize..12,
            picks in prop::collection::btree_set(0usize..12, 0..6),
        ) {
            let mut g = Graph::new();
            let (_, ops) = chain(&mut g, n);
            let markers: Vec<NodeId> = picks
                .into_iter()
                .filter(|&i| i < n)
                .map(|i| ops[i].node_id())
                .collect();
            let k = markers.len();
            let p = plan(&g, ops[n - 1].node_id(), &markers, 2, AllocHint::default()).unwrap();

            prop_assert_eq!(p.segments.len(), p.schedule.len());
            for (pos, &seg) in p.segments.iter().enumerate() {
                prop_assert!(seg <= k);
                prop_assert_eq!(p.assignment[pos], seg % 2);
            }
            // Segments are contiguous and visited in order over the ops.
            let op_segments: Vec<usize> = p
                .schedule
                .order
                .iter()
                .zip(&p.segments)
                .filter(|(id, _)| !g.node(**id).unwrap().is_leaf())
                .map(|(_, &s)| s)
                .collect();
            for w in op_segments.windows(2) {
                prop_assert!(w[0] <= w[1] && w[1] - w[0] <= 1);
            }
            prop_assert_eq!(op_segments.first().copied(), Some(0));
            // Each marker is the last op of its segment.
            for (i, m) in markers.iter().enumerate() {
                prop_assert_eq!(p.segment_of(*m), Some(i));
            }
        }
    }
}
