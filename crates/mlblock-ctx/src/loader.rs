//! Parameter loading from a tensor store.

use std::sync::Arc;

use tracing::debug;

use mlblock_core::alloc::{GraphPlan, Location, Slot};
use mlblock_core::codec::convert;
use mlblock_core::{Backend, DType, Graph, MlbError, Result, StringStore};
use mlblock_io::TensorStore;

use crate::pool::Pool;
use crate::registry::Registry;

/// What a load did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub n_loaded: usize,
    /// Parameters stored in another float dtype and converted.
    pub n_conv: usize,
    /// Parameters already present in a resident pool.
    pub n_resident: usize,
    /// Registered parameters the result does not depend on.
    pub n_unused: usize,
    pub bytes: usize,
}

struct Job {
    key: Arc<str>,
    slot: Slot,
    stored: DType,
    stored_len: usize,
    dtype: DType,
}

/// Load every registered parameter of the sealed graph into `params`.
///
/// All parameters are checked against the store before the first byte is
/// written. With `resident` set the pool already holds the data and only
/// the count is reported.
#[allow(clippy::too_many_arguments)]
pub fn load_params(
    graph: &Graph,
    registry: &Registry,
    strings: &StringStore,
    plan: &GraphPlan,
    params: &mut Pool,
    backends: &[Arc<dyn Backend>],
    store: &dyn TensorStore,
    resident: bool,
) -> Result<LoadReport> {
    let mut report = LoadReport::default();
    let mut jobs = Vec::new();

    for entry in registry.params() {
        let node = entry.tensor.node_id();
        let Some(Location::Param(slot)) = plan.values.get(&node).copied() else {
            report.n_unused += 1;
            continue;
        };
        if resident {
            report.n_resident += 1;
            continue;
        }
        let key = strings
            .get(entry.key)
            .ok_or(MlbError::Graph("store key was never interned"))?;
        let info = store
            .info(&key)
            .ok_or_else(|| MlbError::MissingKey(key.to_string()))?;
        let meta = &graph.node(node)?.meta;
        let dtype_ok = info.dtype == meta.dtype || (info.dtype.is_float() && meta.dtype.is_float());
        if !dtype_ok || !info.shape.same_layout(&meta.shape) {
            return Err(MlbError::LoadMismatch {
                key: key.to_string(),
                stored_dtype: info.dtype,
                stored_shape: info.shape,
                dtype: meta.dtype,
                shape: meta.shape.clone(),
            });
        }
        jobs.push(Job {
            stored_len: info.byte_len(),
            key,
            slot,
            stored: info.dtype,
            dtype: meta.dtype,
        });
    }

    let mut scratch = Vec::new();
    for job in jobs {
        let dst = params
            .buffers_mut()
            .get_mut(job.slot.backend)
            .ok_or(MlbError::Graph("parameter slot on a missing backend"))?
            .slice_mut(job.slot)?;
        if job.stored == job.dtype {
            store.read(&job.key, dst)?;
        } else {
            scratch.clear();
            scratch.resize(job.stored_len, 0);
            store.read(&job.key, &mut scratch)?;
            convert(job.stored, &scratch, job.dtype, dst)?;
            report.n_conv += 1;
        }
        if let Some(backend) = backends.get(job.slot.backend)
            && !backend.is_host()
        {
            debug!(key = %job.key, backend = backend.name(), bytes = job.slot.size, "upload");
        }
        report.n_loaded += 1;
        report.bytes += job.slot.size;
    }

    Ok(report)
}
