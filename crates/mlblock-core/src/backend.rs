//! The pluggable compute engine for node evaluation.
//!
//! A `Backend` knows how to execute a single graph node (op + inputs → output)
//! and how much memory it is willing to hand out. Scheduling, buffer planning
//! and cross-backend transfers are handled by [`alloc`](crate::alloc) and
//! [`exec`](crate::exec); the backend only implements kernel dispatch.

use crate::Result;
use crate::graph::{OpKind, TensorMeta};
use crate::types::{DType, Shape};

/// Materialized input data passed to a backend for evaluation.
pub struct NodeInput<'a> {
    pub data: &'a [f32],
    pub shape: &'a Shape,
    pub dtype: DType,
}

/// Pluggable compute backend.
pub trait Backend: Send + Sync {
    /// Human-readable backend name, used in logs and errors.
    fn name(&self) -> &str;

    /// Whether buffers on this backend are directly host addressable.
    /// Data placed on a non-host backend goes through an upload.
    fn is_host(&self) -> bool {
        true
    }

    /// Largest single buffer this backend can allocate, if bounded.
    fn max_buffer_size(&self) -> Option<usize> {
        None
    }

    /// Evaluate a single op node given its materialized inputs.
    fn eval_node(
        &self,
        op: &OpKind,
        inputs: &[NodeInput<'_>],
        output_meta: &TensorMeta,
    ) -> Result<Vec<f32>>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name())
            .field("host", &self.is_host())
            .finish_non_exhaustive()
    }
}
