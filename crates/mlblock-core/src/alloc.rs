//! Buffer planning for a scheduled graph.
//!
//! Every leaf gets a fixed slot in its backend's parameter arena. Op values
//! get slots in their backend's compute arena, handed out by a best-fit free
//! list over value lifetimes: a slot returns to the list after the last step
//! that reads it. A value read on another backend is copied there first and
//! the copy gets its own compute slot on the reading backend.

use std::collections::HashMap;

use crate::backend::Backend;
use crate::graph::{Graph, LeafKind, NodeId};
use crate::schedule::Schedule;
use crate::{MAX_BYTES, MlbError, Result};

/// Every slot offset and every arena size is a multiple of this.
pub const ALIGNMENT: usize = 32;

fn align_up(n: usize) -> usize {
    n.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// `offset + align_up(size)`, failing once an arena would outgrow [`MAX_BYTES`].
fn arena_end(offset: usize, size: usize) -> Result<usize> {
    offset
        .checked_add(align_up(size.min(MAX_BYTES)))
        .filter(|&end| end <= MAX_BYTES)
        .ok_or(MlbError::Capacity {
            what: "arena bytes",
            limit: MAX_BYTES,
        })
}

// ── Buffers ─────────────────────────────────────────────────────────────

/// One contiguous arena owned by a backend.
#[derive(Debug)]
pub struct Buffer {
    backend: usize,
    data: Vec<u8>,
}

impl Buffer {
    /// Reserve `size` zeroed bytes for backend number `index`.
    ///
    /// Fails with an allocation error when the backend refuses the size or
    /// the host cannot reserve it.
    pub fn new(backend: &dyn Backend, index: usize, pool: &'static str, size: usize) -> Result<Self> {
        let refuse = || MlbError::Allocation {
            backend: backend.name().to_string(),
            pool,
            requested: size,
        };
        if let Some(max) = backend.max_buffer_size()
            && size > max
        {
            return Err(refuse());
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| refuse())?;
        data.resize(size, 0);
        Ok(Self {
            backend: index,
            data,
        })
    }

    pub fn backend(&self) -> usize {
        self.backend
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Address of the first byte; stable for the lifetime of the buffer.
    pub fn base_addr(&self) -> usize {
        self.data.as_ptr() as usize
    }

    pub fn slice(&self, slot: Slot) -> Result<&[u8]> {
        self.data
            .get(slot.offset..slot.offset + slot.size)
            .ok_or(MlbError::Graph("slot lies outside its arena"))
    }

    pub fn slice_mut(&mut self, slot: Slot) -> Result<&mut [u8]> {
        self.data
            .get_mut(slot.offset..slot.offset + slot.size)
            .ok_or(MlbError::Graph("slot lies outside its arena"))
    }
}

// ── Plan ────────────────────────────────────────────────────────────────

/// A byte range inside one backend's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub backend: usize,
    pub offset: usize,
    /// Exact byte length of the value; the reservation is rounded up.
    pub size: usize,
}

impl Slot {
    fn end(&self) -> usize {
        self.offset + align_up(self.size)
    }

    /// Whether the reservations of two slots on the same backend intersect.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.backend == other.backend && self.offset < other.end() && other.offset < self.end()
    }
}

/// Which pool holds a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Param(Slot),
    Compute(Slot),
}

impl Location {
    pub fn slot(&self) -> Slot {
        match self {
            Location::Param(s) | Location::Compute(s) => *s,
        }
    }
}

/// One step of the execution tape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Run the op of `node` on `backend`.
    Kernel { node: NodeId, backend: usize },
    /// Copy `src` into its replica on `backend`. Cached copies only run on
    /// the first execution of the plan.
    Copy {
        src: NodeId,
        backend: usize,
        cached: bool,
    },
}

/// Planning hints supplied by the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocHint {
    /// The plan will be executed repeatedly against the same pools.
    pub reusable: bool,
}

/// Lifetime of one compute slot, in step positions.
#[derive(Clone, Copy, Debug)]
pub struct SlotLifetime {
    pub slot: Slot,
    pub first: usize,
    /// `None` when the slot is never released.
    pub last: Option<usize>,
}

/// A fully planned graph.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    pub steps: Vec<Step>,
    /// Home location of every scheduled node.
    pub values: HashMap<NodeId, Location>,
    /// Replicas of values on backends other than their home.
    pub replicas: HashMap<(NodeId, usize), Slot>,
    /// Bytes needed by each backend's parameter arena.
    pub param_sizes: Vec<usize>,
    /// Bytes needed by each backend's compute arena.
    pub compute_sizes: Vec<usize>,
    pub outputs: Vec<NodeId>,
    pub lifetimes: Vec<SlotLifetime>,
}

impl GraphPlan {
    /// Where `node` can be read from on `backend`.
    pub fn location_on(&self, node: NodeId, backend: usize) -> Option<Location> {
        let home = self.values.get(&node)?;
        if home.slot().backend == backend {
            return Some(*home);
        }
        self.replicas
            .get(&(node, backend))
            .map(|s| Location::Compute(*s))
    }

    pub fn n_copies(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::Copy { .. }))
            .count()
    }
}

// ── Free list ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FreeList {
    /// Free ranges sorted by offset, never adjacent.
    blocks: Vec<(usize, usize)>,
    high_water: usize,
}

impl FreeList {
    fn alloc(&mut self, size: usize) -> Result<usize> {
        let size = align_up(size.min(MAX_BYTES));
        let best = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, (_, len))| *len >= size)
            .min_by_key(|(_, (_, len))| *len)
            .map(|(i, _)| i);
        if let Some(i) = best {
            let (offset, len) = self.blocks[i];
            if len == size {
                self.blocks.remove(i);
            } else {
                self.blocks[i] = (offset + size, len - size);
            }
            return Ok(offset);
        }
        // Grow a free tail block instead of leaving a hole below the new end.
        if let Some(&(offset, len)) = self.blocks.last()
            && offset + len == self.high_water
        {
            self.high_water = arena_end(offset, size)?;
            self.blocks.pop();
            return Ok(offset);
        }
        let offset = self.high_water;
        self.high_water = arena_end(offset, size)?;
        Ok(offset)
    }

    fn free(&mut self, offset: usize, size: usize) {
        let size = align_up(size);
        let pos = self.blocks.partition_point(|&(o, _)| o < offset);
        self.blocks.insert(pos, (offset, size));
        if pos + 1 < self.blocks.len() {
            let (o, l) = self.blocks[pos];
            let (next_o, next_l) = self.blocks[pos + 1];
            if o + l == next_o {
                self.blocks[pos] = (o, l + next_l);
                self.blocks.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_o, prev_l) = self.blocks[pos - 1];
            let (o, l) = self.blocks[pos];
            if prev_o + prev_l == o {
                self.blocks[pos - 1] = (prev_o, prev_l + l);
                self.blocks.remove(pos);
            }
        }
    }
}

// ── Planner ─────────────────────────────────────────────────────────────

/// Plan slots and steps for `schedule`.
///
/// `assignment[i]` is the backend of `schedule.order[i]` and must be below
/// `n_backends`. The outputs of the schedule are never released.
pub fn plan_graph(
    graph: &Graph,
    schedule: &Schedule,
    assignment: &[usize],
    n_backends: usize,
    hint: AllocHint,
) -> Result<GraphPlan> {
    if assignment.len() != schedule.order.len() {
        return Err(MlbError::InvalidArgument(format!(
            "{} backend assignments for {} scheduled nodes",
            assignment.len(),
            schedule.order.len()
        )));
    }
    if n_backends == 0 || assignment.iter().any(|&b| b >= n_backends) {
        return Err(MlbError::InvalidArgument(
            "backend assignment out of range".into(),
        ));
    }
    let home: HashMap<NodeId, usize> = schedule
        .order
        .iter()
        .copied()
        .zip(assignment.iter().copied())
        .collect();

    // Parameter arenas: every leaf, packed in creation order.
    let mut values = HashMap::new();
    let mut param_sizes = vec![0usize; n_backends];
    for (&id, &backend) in schedule.order.iter().zip(assignment) {
        let node = graph.node(id)?;
        if node.is_leaf() {
            let size = node.meta.byte_len();
            let slot = Slot {
                backend,
                offset: param_sizes[backend],
                size,
            };
            param_sizes[backend] = arena_end(param_sizes[backend], size)?;
            values.insert(id, Location::Param(slot));
        }
    }

    // Last step reading each (value, backend) pair.
    let mut last_use: HashMap<(NodeId, usize), usize> = HashMap::new();
    for (pos, (&id, &backend)) in schedule.order.iter().zip(assignment).enumerate() {
        for &inp in graph.node(id)?.inputs.iter() {
            let src = *home
                .get(&inp)
                .ok_or(MlbError::Graph("input missing from schedule"))?;
            last_use.insert((inp, backend), pos);
            if src != backend {
                last_use.insert((inp, src), pos);
            }
        }
    }

    let is_cached = |id: NodeId| -> Result<bool> {
        Ok(hint.reusable && graph.node(id)?.leaf_kind() == Some(LeafKind::Param))
    };

    // Leaves stay in the parameter pool, outputs are protected and cached
    // parameter replicas live as long as the compute pool.
    let mut expiring: Vec<Vec<(NodeId, usize)>> = vec![Vec::new(); schedule.order.len()];
    for (&(id, backend), &pos) in &last_use {
        let keep = if home[&id] == backend {
            graph.node(id)?.is_leaf() || schedule.outputs.contains(&id)
        } else {
            is_cached(id)?
        };
        if !keep {
            expiring[pos].push((id, backend));
        }
    }
    for keys in &mut expiring {
        keys.sort_unstable();
    }

    let mut lists: Vec<FreeList> = (0..n_backends).map(|_| FreeList::default()).collect();
    let mut steps = Vec::with_capacity(schedule.order.len());
    let mut replicas = HashMap::new();
    let mut lifetimes: Vec<SlotLifetime> = Vec::new();
    let mut live: HashMap<(NodeId, usize), usize> = HashMap::new();

    for (pos, (&id, &backend)) in schedule.order.iter().zip(assignment).enumerate() {
        let node = graph.node(id)?;
        if node.is_leaf() {
            continue;
        }

        for &inp in node.inputs.iter() {
            let src = home[&inp];
            if src == backend || replicas.contains_key(&(inp, backend)) {
                continue;
            }
            let cached = is_cached(inp)?;
            let size = graph.node(inp)?.meta.byte_len();
            let slot = Slot {
                backend,
                offset: lists[backend].alloc(size)?,
                size,
            };
            replicas.insert((inp, backend), slot);
            live.insert((inp, backend), lifetimes.len());
            lifetimes.push(SlotLifetime {
                slot,
                first: pos,
                last: None,
            });
            steps.push(Step::Copy {
                src: inp,
                backend,
                cached,
            });
        }

        let size = node.meta.byte_len();
        let slot = Slot {
            backend,
            offset: lists[backend].alloc(size)?,
            size,
        };
        values.insert(id, Location::Compute(slot));
        live.insert((id, backend), lifetimes.len());
        lifetimes.push(SlotLifetime {
            slot,
            first: pos,
            last: None,
        });
        steps.push(Step::Kernel { node: id, backend });

        for key in std::mem::take(&mut expiring[pos]) {
            let Some(idx) = live.remove(&key) else {
                continue;
            };
            let lifetime = &mut lifetimes[idx];
            lifetime.last = Some(pos);
            lists[key.1].free(lifetime.slot.offset, lifetime.slot.size);
        }
    }

    let compute_sizes = lists.iter().map(|l| l.high_water).collect();

    Ok(GraphPlan {
        steps,
        values,
        replicas,
        param_sizes,
        compute_sizes,
        outputs: schedule.outputs.clone(),
        lifetimes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::schedule;
    use crate::{CpuBackend, DType, Shape, Tensor};
    use proptest::prelude::*;

    fn chain(g: &mut Graph, len: usize) -> Tensor {
        let s = Shape::from([8]);
        let mut t = g.new_leaf(LeafKind::Input, "x", DType::F32, &s).unwrap();
        for _ in 0..len {
            t = g.neg(&t).unwrap();
        }
        t
    }

    #[test]
    fn test_free_list_best_fit_and_merge() {
        let mut fl = FreeList::default();
        let a = fl.alloc(64).unwrap();
        let b = fl.alloc(32).unwrap();
        let c = fl.alloc(128).unwrap();
        assert_eq!((a, b, c), (0, 64, 96));
        fl.free(a, 64);
        fl.free(c, 128);
        // Best fit picks the 64 byte hole, not the 128 byte tail.
        assert_eq!(fl.alloc(40).unwrap(), 0);
        fl.free(0, 64);
        fl.free(b, 32);
        assert_eq!(fl.blocks, vec![(0, 224)]);
        assert_eq!(fl.high_water, 224);
    }

    #[test]
    fn test_free_list_refuses_to_outgrow_the_address_space() {
        let mut fl = FreeList::default();
        assert_eq!(fl.alloc(1 << 62).unwrap(), 0);
        assert!(matches!(fl.alloc(1 << 62), Err(MlbError::Capacity { .. })));
        // A failed request leaves the list untouched.
        assert_eq!(fl.high_water, 1 << 62);
        assert_eq!(fl.alloc(64).unwrap(), 1 << 62);
    }

    #[test]
    fn test_param_arena_overflow_is_a_capacity_error() {
        let mut g = Graph::new();
        let s = Shape::from([1 << 30, 1 << 30]);
        let a = g.new_leaf(LeafKind::Param, "a", DType::F32, &s).unwrap();
        let b = g.new_leaf(LeafKind::Param, "b", DType::F32, &s).unwrap();
        let y = g.add(&a, &b).unwrap();
        let sched = schedule(&g, &[y.node_id()]).unwrap();
        let err = plan_graph(&g, &sched, &vec![0; sched.len()], 1, AllocHint::default()).unwrap_err();
        assert!(matches!(err, MlbError::Capacity { what: "arena bytes", .. }));

        // Either leaf alone fits.
        let sched = schedule(&g, &[a.node_id()]).unwrap();
        let plan = plan_graph(&g, &sched, &[0], 1, AllocHint::default()).unwrap();
        assert_eq!(plan.param_sizes, vec![1 << 62]);
    }

    #[test]
    fn test_chain_reuses_slots() {
        let mut g = Graph::new();
        let out = chain(&mut g, 10);
        let sched = schedule(&g, &[out.node_id()]).unwrap();
        let plan = plan_graph(&g, &sched, &vec![0; sched.len()], 1, AllocHint::default()).unwrap();
        // Each neg reads the previous one; two live values at a time at most.
        assert_eq!(plan.compute_sizes, vec![64]);
        assert_eq!(plan.param_sizes, vec![32]);
        assert!(matches!(plan.values[&out.node_id()], Location::Compute(_)));
        assert_eq!(plan.n_copies(), 0);
    }

    #[test]
    fn test_cross_backend_copy() {
        let mut g = Graph::new();
        let s = Shape::from([4]);
        let w = g.new_leaf(LeafKind::Param, "w", DType::F16, &s).unwrap();
        let x = g.new_leaf(LeafKind::Input, "x", DType::F32, &s).unwrap();
        let a = g.add(&x, &w).unwrap();
        let b = g.mul(&a, &w).unwrap();
        let sched = schedule(&g, &[b.node_id()]).unwrap();
        // w, x, a on backend 0; b on backend 1.
        let assign = vec![0, 0, 0, 1];
        let plan = plan_graph(&g, &sched, &assign, 2, AllocHint { reusable: true }).unwrap();
        assert!(plan.replicas.contains_key(&(a.node_id(), 1)));
        assert!(plan.replicas.contains_key(&(w.node_id(), 1)));
        let cached: Vec<_> = plan
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Copy { src, cached, .. } => Some((*src, *cached)),
                _ => None,
            })
            .collect();
        assert_eq!(cached, vec![(a.node_id(), false), (w.node_id(), true)]);
        assert_eq!(
            plan.location_on(w.node_id(), 1),
            Some(Location::Compute(plan.replicas[&(w.node_id(), 1)]))
        );
        assert!(plan.location_on(b.node_id(), 0).is_none());
    }

    #[test]
    fn test_buffer_respects_backend_limit() {
        let backend = CpuBackend::new().with_memory_limit(64);
        let buf = Buffer::new(&backend, 0, "compute", 64).unwrap();
        assert_eq!(buf.size(), 64);
        let err = Buffer::new(&backend, 0, "compute", 65).unwrap_err();
        assert!(matches!(err, MlbError::Allocation { requested: 65, .. }));
    }

    fn arb_graph() -> impl Strategy<Value = (Vec<(u8, u8, u8)>, Vec<u8>)> {
        (
            prop::collection::vec((any::<u8>(), any::<u8>(), 1u8..5), 1..24),
            prop::collection::vec(0u8..3, 64),
        )
    }

    proptest! {
        #[test]
        fn prop_live_slots_never_overlap((ops, backends) in arb_graph()) {
            let mut g = Graph::new();
            let mut values = Vec::new();
            for i in 0..3 {
                let kind = if i == 0 { LeafKind::Input } else { LeafKind::Param };
                values.push(g.new_leaf(kind, &format!("l{i}"), DType::F32, &Shape::from([4])).unwrap());
            }
            for (a, b, op) in ops {
                let x = values[a as usize % values.len()].clone();
                let y = values[b as usize % values.len()].clone();
                let t = match op {
                    1 => g.add(&x, &y).unwrap(),
                    2 => g.mul(&x, &y).unwrap(),
                    3 => g.neg(&x).unwrap(),
                    _ => g.exp(&y).unwrap(),
                };
                values.push(t);
            }
            let out = values.last().unwrap().node_id();
            let sched = schedule(&g, &[out]).unwrap();
            let assign: Vec<usize> = (0..sched.len()).map(|i| backends[i % backends.len()] as usize).collect();
            let plan = plan_graph(&g, &sched, &assign, 3, AllocHint::default()).unwrap();

            for (i, a) in plan.lifetimes.iter().enumerate() {
                prop_assert!(a.slot.end() <= plan.compute_sizes[a.slot.backend]);
                for b in &plan.lifetimes[i + 1..] {
                    let a_end = a.last.unwrap_or(usize::MAX);
                    let b_end = b.last.unwrap_or(usize::MAX);
                    let concurrent = a.first <= b_end && b.first <= a_end;
                    prop_assert!(!(concurrent && a.slot.overlaps(&b.slot)));
                }
            }
            prop_assert!(matches!(plan.values[&out], Location::Compute(_) | Location::Param(_)));
        }
    }
}
