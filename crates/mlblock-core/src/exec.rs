//! Runs a [`GraphPlan`] over per-backend buffers.

use std::sync::Arc;

use tracing::trace;

use crate::alloc::{Buffer, GraphPlan, Location, Step};
use crate::backend::{Backend, NodeInput};
use crate::codec::{decode_f32, encode_f32};
use crate::graph::{Graph, NodeId};
use crate::{MlbError, Result};

/// Counters for one execution of a plan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub n_kernels: usize,
    pub n_copies: usize,
    pub bytes_copied: usize,
}

fn read_bytes<'a>(loc: Location, params: &'a [Buffer], compute: &'a [Buffer]) -> Result<&'a [u8]> {
    let (pool, slot) = match loc {
        Location::Param(s) => (params, s),
        Location::Compute(s) => (compute, s),
    };
    pool.get(slot.backend)
        .ok_or(MlbError::Graph("plan refers to a missing arena"))?
        .slice(slot)
}

fn compute_slice(compute: &mut [Buffer], loc: Location) -> Result<&mut [u8]> {
    let Location::Compute(slot) = loc else {
        return Err(MlbError::Graph("op values live in the compute pool"));
    };
    compute
        .get_mut(slot.backend)
        .ok_or(MlbError::Graph("plan refers to a missing arena"))?
        .slice_mut(slot)
}

/// Decode the value of `id` as visible on `backend`.
pub fn read_value(
    graph: &Graph,
    plan: &GraphPlan,
    id: NodeId,
    backend: usize,
    params: &[Buffer],
    compute: &[Buffer],
) -> Result<Vec<f32>> {
    let loc = plan
        .location_on(id, backend)
        .ok_or(MlbError::Graph("value is not available on this backend"))?;
    decode_f32(graph.node(id)?.meta.dtype, read_bytes(loc, params, compute)?)
}

/// Execute every step of `plan`.
///
/// Leaves must already be materialized in `params`. Cached copies run only
/// when `first_run` is set; afterwards their replicas are assumed intact.
pub fn execute(
    graph: &Graph,
    plan: &GraphPlan,
    backends: &[Arc<dyn Backend>],
    params: &[Buffer],
    compute: &mut [Buffer],
    first_run: bool,
) -> Result<ExecStats> {
    let mut stats = ExecStats::default();

    for step in &plan.steps {
        match *step {
            Step::Copy {
                src,
                backend,
                cached,
            } => {
                if cached && !first_run {
                    continue;
                }
                let from = *plan
                    .values
                    .get(&src)
                    .ok_or(MlbError::Graph("copy source was never planned"))?;
                let to = plan
                    .replicas
                    .get(&(src, backend))
                    .copied()
                    .map(Location::Compute)
                    .ok_or(MlbError::Graph("copy target was never planned"))?;
                let bytes = read_bytes(from, params, compute)?.to_vec();
                compute_slice(compute, to)?.copy_from_slice(&bytes);
                trace!(
                    node = %src,
                    from = from.slot().backend,
                    to = backend,
                    bytes = bytes.len(),
                    "copy"
                );
                stats.n_copies += 1;
                stats.bytes_copied += bytes.len();
            }
            Step::Kernel { node, backend } => {
                let n = graph.node(node)?;
                let be = backends
                    .get(backend)
                    .ok_or(MlbError::Graph("plan refers to a missing backend"))?;

                let mut data = Vec::with_capacity(n.inputs.len());
                for &inp in n.inputs.iter() {
                    data.push(read_value(graph, plan, inp, backend, params, compute)?);
                }
                let mut inputs = Vec::with_capacity(n.inputs.len());
                for (&inp, values) in n.inputs.iter().zip(&data) {
                    let meta = &graph.node(inp)?.meta;
                    inputs.push(NodeInput {
                        data: values,
                        shape: &meta.shape,
                        dtype: meta.dtype,
                    });
                }

                let wrap = |e: MlbError| MlbError::Execution {
                    backend: be.name().to_string(),
                    op: n.op.name(),
                    node: if n.name.is_empty() {
                        node.to_string()
                    } else {
                        n.name.clone()
                    },
                    source: Box::new(e),
                };
                let out = be.eval_node(&n.op, &inputs, &n.meta).map_err(wrap)?;
                if out.len() as i64 != n.meta.shape.numel() {
                    return Err(wrap(MlbError::InvalidArgument(format!(
                        "kernel produced {} elements for {}",
                        out.len(),
                        n.meta.shape
                    ))));
                }
                let loc = *plan
                    .values
                    .get(&node)
                    .ok_or(MlbError::Graph("kernel output was never planned"))?;
                encode_f32(n.meta.dtype, &out, compute_slice(compute, loc)?)?;
                stats.n_kernels += 1;
            }
        }
    }

    Ok(stats)
}
