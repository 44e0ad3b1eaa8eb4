//! The computation controller.
//!
//! A [`MlCtx`] runs one computation at a time through
//! `Idle → Building → Sealed → Loaded → Ready → Computed`:
//!
//! 1. `begin` opens a computation and snapshots the configuration.
//! 2. Tensors are created and registered under hierarchical names.
//! 3. `build_alloc` seals the registry, plans the graph rooted at the result
//!    and allocates the parameter and compute pools.
//! 4. `tstore_load` fills parameters from a tensor store; `input_set` binds
//!    inputs.
//! 5. `compute` executes; `output_get` copies the result out.
//! 6. `end` releases the pools and returns to `Idle`.
//!
//! A fatal error moves the computation to `Failed`, where only `end` is
//! accepted.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use mlblock_core::alloc::{AllocHint, Location, Slot};
use mlblock_core::codec::convert;
use mlblock_core::dump::write_dot;
use mlblock_core::exec::execute;
use mlblock_core::schedule::schedule;
use mlblock_core::{
    Backend, DType, Graph, LeafKind, MlbError, NodeId, Result, Shape, StringStore, Tensor,
    TensorMeta,
};
use mlblock_io::{LocalTensor, MemoryStore, TensorStore};

use crate::config::{Config, ParamResidency};
use crate::loader::load_params;
use crate::planner::{self, Planned};
use crate::pool::{Lifetime, Pool};
use crate::registry::{EntryKind, Registry, TensorEntry};
use crate::resolver::Resolver;
use crate::stats::Stats;

/// Where the active computation is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Building,
    Sealed,
    Loaded,
    Ready,
    Computed,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Building => "building",
            Phase::Sealed => "sealed",
            Phase::Loaded => "loaded",
            Phase::Ready => "ready",
            Phase::Computed => "computed",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A registered tensor with its names resolved.
#[derive(Clone, Debug)]
pub struct EntryView {
    pub name: Arc<str>,
    pub key: Arc<str>,
    pub kind: EntryKind,
    pub tensor: Tensor,
}

/// Identity of a parameter pool: every leaf with its slot.
#[derive(Clone, Debug, PartialEq)]
struct LeafSig {
    name: String,
    kind: LeafKind,
    meta: TensorMeta,
    slot: Slot,
}

fn signature(graph: &Graph, planned: &Planned) -> Vec<LeafSig> {
    planned
        .schedule
        .order
        .iter()
        .filter_map(|&id| {
            let node = graph.get(id)?;
            let kind = node.leaf_kind()?;
            let Some(Location::Param(slot)) = planned.plan.values.get(&id) else {
                return None;
            };
            Some(LeafSig {
                name: node.name.clone(),
                kind,
                meta: node.meta.clone(),
                slot: *slot,
            })
        })
        .collect()
}

struct ResidentParams {
    signature: Vec<LeafSig>,
    pool: Pool,
}

struct Computation {
    name: String,
    cfg: Config,
    phase: Phase,
    graph: Graph,
    resolver: Resolver,
    registry: Registry,
    inputs: Vec<Tensor>,
    bound: Vec<bool>,
    planned: Option<Planned>,
    params: Option<Pool>,
    compute: Option<Pool>,
    resident_hit: bool,
    n_runs: usize,
    output: Option<LocalTensor>,
}

impl Computation {
    fn new(name: &str, cfg: Config) -> Self {
        let resolver = Resolver::new(cfg.tpath_sep, cfg.tprefix.clone());
        Self {
            name: name.to_string(),
            cfg,
            phase: Phase::Building,
            graph: Graph::new(),
            resolver,
            registry: Registry::new(),
            inputs: Vec::new(),
            bound: Vec::new(),
            planned: None,
            params: None,
            compute: None,
            resident_hit: false,
            n_runs: 0,
            output: None,
        }
    }

    fn check_capacity(&self) -> Result<()> {
        if self.registry.n_entries() + self.inputs.len() >= self.cfg.n_tensor_max {
            return Err(MlbError::Capacity {
                what: "registered tensors",
                limit: self.cfg.n_tensor_max,
            });
        }
        Ok(())
    }

    fn all_bound(&self) -> bool {
        self.bound.iter().all(|&b| b)
    }

    fn fail(&mut self, err: MlbError) -> MlbError {
        warn!(name = %self.name, phase = %self.phase, error = %err, "computation failed");
        self.phase = Phase::Failed;
        err
    }
}

fn active(comp: &Option<Computation>) -> Result<&Computation> {
    comp.as_ref()
        .ok_or_else(|| MlbError::usage("no active computation; call begin first"))
}

fn usable(comp: &mut Option<Computation>) -> Result<&mut Computation> {
    let c = comp
        .as_mut()
        .ok_or_else(|| MlbError::usage("no active computation; call begin first"))?;
    if c.phase == Phase::Failed {
        return Err(MlbError::usage(format!(
            "computation `{}` has failed; only end is accepted",
            c.name
        )));
    }
    Ok(c)
}

fn building(comp: &mut Option<Computation>) -> Result<&mut Computation> {
    let c = usable(comp)?;
    if c.phase != Phase::Building {
        return Err(MlbError::usage(format!(
            "computation `{}` is {}; tensors can only be defined before build_alloc",
            c.name, c.phase
        )));
    }
    Ok(c)
}

/// Copy the bytes behind `node` out of whichever pool holds them.
fn read_local(
    graph: &Graph,
    planned: &Planned,
    node: NodeId,
    params: &Pool,
    compute: &Pool,
) -> Result<LocalTensor> {
    let meta = &graph.node(node)?.meta;
    let loc = *planned
        .plan
        .values
        .get(&node)
        .ok_or(MlbError::Graph("result was never planned"))?;
    let (pool, slot) = match loc {
        Location::Param(s) => (params, s),
        Location::Compute(s) => (compute, s),
    };
    let bytes = pool
        .buffers()
        .get(slot.backend)
        .ok_or(MlbError::Graph("result on a missing backend"))?
        .slice(slot)?;
    LocalTensor::new(meta.dtype, meta.shape.clone(), bytes.to_vec())
}

/// A computation context: backends, names, pools and the active computation.
pub struct MlCtx {
    backends: Vec<Arc<dyn Backend>>,
    strings: Arc<StringStore>,
    store: Option<Arc<dyn TensorStore>>,
    config: Config,
    stats: Stats,
    resident: Option<ResidentParams>,
    comp: Option<Computation>,
}

impl std::fmt::Debug for MlCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlCtx")
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("computation", &self.comp.as_ref().map(|c| &c.name))
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl MlCtx {
    /// A context with a single backend.
    pub fn new(backend: Arc<dyn Backend>, strings: Arc<StringStore>) -> Self {
        Self {
            backends: vec![backend],
            strings,
            store: None,
            config: Config::default(),
            stats: Stats::default(),
            resident: None,
            comp: None,
        }
    }

    /// A context splitting work over `backends`; the first is the primary.
    pub fn with_backends(backends: Vec<Arc<dyn Backend>>, strings: Arc<StringStore>) -> Result<Self> {
        let mut iter = backends.into_iter();
        let primary = iter
            .next()
            .ok_or_else(|| MlbError::InvalidArgument("a context needs at least one backend".into()))?;
        let mut ctx = Self::new(primary, strings);
        ctx.backends.extend(iter);
        Ok(ctx)
    }

    pub fn with_store(mut self, store: Arc<dyn TensorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn set_store(&mut self, store: Option<Arc<dyn TensorStore>>) {
        self.store = store;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Changes apply from the next `begin`.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn strings(&self) -> &Arc<StringStore> {
        &self.strings
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub fn begin(&mut self, name: &str) -> Result<()> {
        if let Some(c) = &self.comp {
            return Err(MlbError::usage(format!(
                "computation `{}` is still active; call end first",
                c.name
            )));
        }
        let cfg = self.config.snapshot();
        debug!(name, flags = ?cfg.flags, "begin");
        self.stats = Stats::default();
        self.comp = Some(Computation::new(name, cfg));
        Ok(())
    }

    /// Finish the active computation, whatever its phase.
    pub fn end(&mut self) -> Result<()> {
        let mut comp = self
            .comp
            .take()
            .ok_or_else(|| MlbError::usage("end without an active computation"))?;

        if comp.phase == Phase::Failed {
            warn!(name = %comp.name, "computation ended in the failed state");
        } else if !comp.cfg.flags.quiet {
            info!(name = %comp.name, "{}", self.stats);
        }

        comp.compute = None;
        let loaded = matches!(comp.phase, Phase::Loaded | Phase::Ready | Phase::Computed);
        if comp.cfg.param_residency == ParamResidency::Resident
            && loaded
            && let (Some(mut pool), Some(planned)) = (comp.params.take(), comp.planned.as_ref())
        {
            pool.set_lifetime(Lifetime::Resident);
            debug!(name = %comp.name, bytes = pool.size(), "parameter pool kept resident");
            self.resident = Some(ResidentParams {
                signature: signature(&comp.graph, planned),
                pool,
            });
        }
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.comp.as_ref().map_or(Phase::Idle, |c| c.phase)
    }

    /// Name of the active computation.
    pub fn name(&self) -> Option<&str> {
        self.comp.as_ref().map(|c| c.name.as_str())
    }

    /// Statistics of the active (or last) computation.
    pub fn info(&self) -> &Stats {
        &self.stats
    }

    // ── Definition ──────────────────────────────────────────────────────

    /// Open a name scope; names registered until the matching
    /// [`block_end`](Self::block_end) are prefixed with `name`.
    pub fn block_begin(&mut self, name: &str) -> Result<()> {
        let c = building(&mut self.comp)?;
        c.resolver.push(name)?;
        c.registry.scope_begin(self.strings.intern(name))?;
        debug!(scope = name, depth = c.resolver.depth(), "block begin");
        Ok(())
    }

    pub fn block_end(&mut self) -> Result<()> {
        let c = building(&mut self.comp)?;
        let scope = c.resolver.pop()?;
        c.registry.scope_end()?;
        debug!(scope, "block end");
        Ok(())
    }

    /// Register `tensor` under `name` in the open scopes. Leaves become
    /// parameters, anything else a named op. A tensor has at most one name.
    pub fn tensor_add(&mut self, name: &str, tensor: &Tensor) -> Result<Tensor> {
        let c = building(&mut self.comp)?;
        let node = c.graph.check(tensor)?;
        if let Some(entry) = c.registry.find(node) {
            let prev = self.strings.get(entry.name).unwrap_or_else(|| Arc::from("?"));
            return Err(MlbError::usage(format!(
                "tensor {tensor} is already registered as `{prev}`"
            )));
        }
        c.check_capacity()?;
        let kind = match c.graph.node(node)?.leaf_kind() {
            Some(LeafKind::Param) => EntryKind::Param,
            Some(LeafKind::Input) => {
                return Err(MlbError::usage(format!(
                    "input {tensor} cannot be registered as a parameter"
                )));
            }
            None => EntryKind::Op,
        };
        let full = c.resolver.resolve(name)?;
        let id = self.strings.intern(&full);
        if c.registry.contains_name(id) {
            return Err(MlbError::usage(format!(
                "tensor name `{full}` is already registered"
            )));
        }
        c.registry.add(TensorEntry {
            tensor: tensor.clone(),
            name: id,
            key: id,
            kind,
        })?;
        c.graph.set_name(node, full);
        Ok(tensor.clone())
    }

    /// Mark `tensor` as the last node of the current backend segment.
    pub fn split_add(&mut self, tensor: &Tensor) -> Result<Tensor> {
        let c = building(&mut self.comp)?;
        c.graph.check(tensor)?;
        c.registry.split(tensor.clone())?;
        Ok(tensor.clone())
    }

    /// A caller-supplied leaf, bound with [`input_set`](Self::input_set).
    pub fn input_new(&mut self, name: &str, dtype: DType, shape: impl Into<Shape>) -> Result<Tensor> {
        let c = building(&mut self.comp)?;
        c.check_capacity()?;
        let t = c.graph.new_leaf(LeafKind::Input, name, dtype, &shape.into())?;
        debug!(name, "input {t}");
        c.inputs.push(t.clone());
        c.bound.push(false);
        Ok(t)
    }

    /// A parameter leaf, loaded from the tensor store by its key.
    pub fn param_new(&mut self, name: &str, dtype: DType, shape: impl Into<Shape>) -> Result<Tensor> {
        let c = building(&mut self.comp)?;
        let t = c.graph.new_leaf(LeafKind::Param, name, dtype, &shape.into())?;
        self.tensor_add(name, &t)
    }

    /// A parameter of the configured weight dtype.
    pub fn weight_new(&mut self, name: &str, shape: impl Into<Shape>) -> Result<Tensor> {
        let wtype = active(&self.comp)?.cfg.wtype;
        self.param_new(name, wtype, shape)
    }

    /// The graph, for applying ops while building.
    pub fn ops(&mut self) -> Result<&mut Graph> {
        Ok(&mut building(&mut self.comp)?.graph)
    }

    pub fn inputs(&self) -> &[Tensor] {
        self.comp.as_ref().map_or(&[], |c| c.inputs.as_slice())
    }

    /// Registered tensors in registration order.
    pub fn entries(&self) -> Vec<EntryView> {
        let Some(c) = &self.comp else {
            return Vec::new();
        };
        let resolve = |id| self.strings.get(id).unwrap_or_else(|| Arc::from(""));
        c.registry
            .entries()
            .map(|e| EntryView {
                name: resolve(e.name),
                key: resolve(e.key),
                kind: e.kind,
                tensor: e.tensor.clone(),
            })
            .collect()
    }

    // ── Sealing and loading ─────────────────────────────────────────────

    /// Seal the registry, plan the graph rooted at `result` and allocate
    /// both pools.
    ///
    /// With the dump flag set the sealed graph is also written to
    /// `<dump_dir>/<name>.dot`. That file is a debugging aid: failing to
    /// write it is logged as a warning and does not fail the computation.
    pub fn build_alloc(&mut self, result: &Tensor) -> Result<()> {
        let c = building(&mut self.comp)?;
        let root = c.graph.check(result)?;
        if c.resolver.depth() > 0 {
            return Err(MlbError::usage(format!(
                "{} block(s) still open: {}",
                c.resolver.depth(),
                c.resolver.scopes().join(", ")
            )));
        }
        c.registry.seal();

        match Self::seal_and_allocate(c, root, &self.backends, &mut self.resident, &mut self.stats) {
            Ok(()) => {
                if c.cfg.flags.dump {
                    let path = c.cfg.dump_dir.join(format!("{}.dot", c.name));
                    if let Err(e) = Self::dump_sealed(c, &path) {
                        warn!(path = %path.display(), error = %e, "graph dump failed");
                    }
                }
                c.phase = Phase::Sealed;
                Ok(())
            }
            Err(e) => Err(c.fail(e)),
        }
    }

    fn seal_and_allocate(
        c: &mut Computation,
        root: NodeId,
        backends: &[Arc<dyn Backend>],
        resident: &mut Option<ResidentParams>,
        stats: &mut Stats,
    ) -> Result<()> {
        let hint = AllocHint {
            reusable: c.cfg.flags.multi_compute,
        };
        let planned = planner::plan(&c.graph, root, &c.registry.splits(), backends.len(), hint)?;

        for &id in &planned.schedule.order {
            let node = c.graph.node(id)?;
            let known = match node.leaf_kind() {
                Some(LeafKind::Input) => c.inputs.iter().any(|t| t.node_id() == id),
                Some(LeafKind::Param) => c.registry.find(id).is_some(),
                None => true,
            };
            if !known {
                return Err(MlbError::usage(format!(
                    "leaf {id} `{}` was neither registered nor created as an input",
                    node.name
                )));
            }
        }

        let sig = signature(&c.graph, &planned);
        let keep = c.cfg.param_residency == ParamResidency::Resident;
        let (params, hit) = match resident.take() {
            Some(r) if keep && r.signature == sig => (r.pool, true),
            _ => {
                let lifetime = if keep {
                    Lifetime::Resident
                } else {
                    Lifetime::Computation
                };
                let pool = Pool::allocate("params", lifetime, backends, &planned.plan.param_sizes)?;
                (pool, false)
            }
        };
        let compute_lifetime = if c.cfg.flags.multi_compute {
            Lifetime::Computation
        } else {
            Lifetime::Invocation
        };
        let compute = Pool::allocate(
            "compute",
            compute_lifetime,
            backends,
            &planned.plan.compute_sizes,
        )?;

        stats.mem_params = params.size();
        stats.mem_compute = compute.size();
        stats.mem_total = stats.mem_params + stats.mem_compute;
        debug!(
            name = %c.name,
            nodes = planned.schedule.len(),
            mem_params = stats.mem_params,
            mem_compute = stats.mem_compute,
            resident = hit,
            "graph sealed"
        );

        c.planned = Some(planned);
        c.params = Some(params);
        c.compute = Some(compute);
        c.resident_hit = hit;
        Ok(())
    }

    /// Load every parameter from `store`.
    ///
    /// When sealing handed over a resident parameter pool (same leaves,
    /// names and layout as the computation that left it) the pool already
    /// holds the data and `store` is not read at all. Switch residency to
    /// [`ParamResidency::PerComputation`] before `begin` to reload from a
    /// different store.
    pub fn tstore_load(&mut self, store: &dyn TensorStore) -> Result<()> {
        let c = usable(&mut self.comp)?;
        if c.phase != Phase::Sealed {
            return Err(MlbError::usage(format!(
                "tstore_load needs a sealed, not yet loaded graph; computation is {}",
                c.phase
            )));
        }

        let t0 = Instant::now();
        let (Some(planned), Some(params)) = (c.planned.as_ref(), c.params.as_mut()) else {
            return Err(c.fail(MlbError::Graph("sealed computation without pools")));
        };
        let loaded = load_params(
            &c.graph,
            &c.registry,
            &self.strings,
            &planned.plan,
            params,
            &self.backends,
            store,
            c.resident_hit,
        );
        let report = match loaded {
            Ok(r) => r,
            Err(e) => return Err(c.fail(e)),
        };

        self.stats.t_load = t0.elapsed().as_secs_f64();
        self.stats.n_conv = report.n_conv;
        self.stats.n_resident = report.n_resident;
        debug!(
            loaded = report.n_loaded,
            converted = report.n_conv,
            resident = report.n_resident,
            unused = report.n_unused,
            bytes = report.bytes,
            "parameters loaded"
        );
        c.phase = if c.all_bound() {
            Phase::Ready
        } else {
            Phase::Loaded
        };
        Ok(())
    }

    /// `build_alloc` followed by `tstore_load` from the configured store.
    pub fn prep(&mut self, result: &Tensor) -> Result<()> {
        self.build_alloc(result)?;
        match self.store.clone() {
            Some(store) => self.tstore_load(store.as_ref()),
            None => self.tstore_load(&MemoryStore::new()),
        }
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Bind input number `index` (creation order).
    pub fn input_set(&mut self, index: usize, data: &LocalTensor) -> Result<()> {
        let c = usable(&mut self.comp)?;
        if matches!(c.phase, Phase::Idle | Phase::Building) {
            return Err(MlbError::usage("inputs can only be set after build_alloc"));
        }
        let input = c.inputs.get(index).ok_or_else(|| {
            MlbError::usage(format!(
                "input index {index} out of range ({} inputs)",
                c.inputs.len()
            ))
        })?;
        let meta = input.meta().clone();
        let node = input.node_id();
        if !data.shape().same_layout(&meta.shape) {
            return Err(MlbError::ShapeMismatch {
                expected: meta.shape.0.clone(),
                got: data.shape().0.clone(),
            });
        }
        if data.dtype() != meta.dtype && !(data.dtype().is_float() && meta.dtype.is_float()) {
            return Err(MlbError::InvalidArgument(format!(
                "input {index} is {}, got {}",
                meta.dtype,
                data.dtype()
            )));
        }

        let (Some(planned), Some(params)) = (c.planned.as_ref(), c.params.as_mut()) else {
            return Err(c.fail(MlbError::Graph("sealed computation without pools")));
        };
        // Inputs the result does not depend on have no slot.
        if let Some(Location::Param(slot)) = planned.plan.values.get(&node).copied() {
            let dst = params
                .buffers_mut()
                .get_mut(slot.backend)
                .ok_or(MlbError::Graph("input slot on a missing backend"))?
                .slice_mut(slot)?;
            convert(data.dtype(), data.as_bytes(), meta.dtype, dst)?;
        }

        c.bound[index] = true;
        if c.phase == Phase::Loaded && c.all_bound() {
            c.phase = Phase::Ready;
        }
        Ok(())
    }

    /// Execute the sealed graph.
    pub fn compute(&mut self) -> Result<()> {
        let c = usable(&mut self.comp)?;
        match c.phase {
            Phase::Ready => {}
            Phase::Computed if c.cfg.flags.multi_compute => {}
            Phase::Computed => {
                return Err(MlbError::usage(format!(
                    "computation `{}` was already computed; enable multi_compute to compute again",
                    c.name
                )));
            }
            Phase::Loaded => {
                return Err(MlbError::usage("compute needs every input bound"));
            }
            phase => {
                return Err(MlbError::usage(format!(
                    "compute needs a loaded graph; computation is {phase}"
                )));
            }
        }

        let t0 = Instant::now();
        let (Some(planned), Some(params), Some(compute)) =
            (c.planned.as_ref(), c.params.as_ref(), c.compute.as_mut())
        else {
            return Err(c.fail(MlbError::Graph("ready computation without pools")));
        };
        let outcome = execute(
            &c.graph,
            &planned.plan,
            &self.backends,
            params.buffers(),
            compute.buffers_mut(),
            c.n_runs == 0,
        )
        .and_then(|exec| {
            let root = planned
                .result()
                .ok_or(MlbError::Graph("sealed graph without a result"))?;
            Ok((exec, read_local(&c.graph, planned, root, params, compute)?))
        });
        let (exec, out) = match outcome {
            Ok(v) => v,
            Err(e) => return Err(c.fail(e)),
        };

        c.output = Some(out);
        c.n_runs += 1;
        if compute.lifetime() == Lifetime::Invocation {
            c.compute = None;
        }
        c.phase = Phase::Computed;

        self.stats.t_compute += t0.elapsed().as_secs_f64();
        self.stats.n_compute += 1;
        self.stats.n_transfer += exec.n_copies;
        Ok(())
    }

    /// Copy of the result of the last compute.
    pub fn output_get(&self) -> Result<LocalTensor> {
        let c = active(&self.comp)?;
        c.output
            .clone()
            .ok_or_else(|| MlbError::usage("no result yet; call compute first"))
    }

    /// One-shot convenience: define, load, bind `inputs`, compute and
    /// return the result. The computation is ended even on error.
    pub fn run<F>(&mut self, name: &str, inputs: &[&LocalTensor], define: F) -> Result<LocalTensor>
    where
        F: FnOnce(&mut MlCtx, &[Tensor]) -> Result<Tensor>,
    {
        self.begin(name)?;
        let out = self.run_inner(inputs, define);
        let ended = self.end();
        let out = out?;
        ended?;
        Ok(out)
    }

    fn run_inner<F>(&mut self, inputs: &[&LocalTensor], define: F) -> Result<LocalTensor>
    where
        F: FnOnce(&mut MlCtx, &[Tensor]) -> Result<Tensor>,
    {
        let mut handles = Vec::with_capacity(inputs.len());
        for (i, t) in inputs.iter().enumerate() {
            handles.push(self.input_new(&format!("input{i}"), t.dtype(), t.shape().clone())?);
        }
        let result = define(self, &handles)?;
        self.prep(&result)?;
        for (i, t) in inputs.iter().enumerate() {
            self.input_set(i, t)?;
        }
        self.compute()?;
        self.output_get()
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Segment of `tensor` in the sealed graph.
    pub fn segment_of(&self, tensor: &Tensor) -> Option<usize> {
        self.comp.as_ref()?.planned.as_ref()?.segment_of(tensor.node_id())
    }

    /// Backend index running `tensor` in the sealed graph.
    pub fn backend_of(&self, tensor: &Tensor) -> Option<usize> {
        self.comp.as_ref()?.planned.as_ref()?.backend_of(tensor.node_id())
    }

    /// `(base address, size)` of every compute arena, while allocated.
    pub fn compute_pool_layout(&self) -> Option<Vec<(usize, usize)>> {
        Some(self.comp.as_ref()?.compute.as_ref()?.layout())
    }

    /// `(base address, size)` of every parameter arena, while allocated.
    pub fn param_pool_layout(&self) -> Option<Vec<(usize, usize)>> {
        match &self.comp {
            Some(c) => Some(c.params.as_ref()?.layout()),
            None => Some(self.resident.as_ref()?.pool.layout()),
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Write the graph as DOT: the sealed graph, or before sealing the graph
    /// rooted at the last registered tensor.
    pub fn graph_dump(&self, out: &mut dyn Write) -> Result<()> {
        let c = active(&self.comp)?;
        if let Some(planned) = &c.planned {
            return write_dot(
                &c.graph,
                &planned.schedule.order,
                Some(&planned.assignment),
                out,
            );
        }
        let order = match c.registry.last_tensor() {
            Some(root) => schedule(&c.graph, &[root.node_id()])?.order,
            None => c.graph.iter().map(|n| n.id).collect(),
        };
        write_dot(&c.graph, &order, None, out)
    }

    pub fn graph_dump_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(fs::File::create(path.as_ref())?);
        self.graph_dump(&mut out)?;
        out.flush()?;
        Ok(())
    }

    fn dump_sealed(c: &Computation, path: &Path) -> Result<()> {
        let Some(planned) = &c.planned else {
            return Ok(());
        };
        let mut out = BufWriter::new(fs::File::create(path)?);
        write_dot(
            &c.graph,
            &planned.schedule.order,
            Some(&planned.assignment),
            &mut out,
        )?;
        out.flush()?;
        debug!(path = %path.display(), "graph dumped");
        Ok(())
    }
}
