//! Tensor handles pointing at nodes of a [`Graph`](crate::Graph).
//!
//! A `Tensor` carries the node id plus the metadata known at build time.
//! It owns no data: the bytes live in whichever pool the planner assigned
//! the node to.

use crate::graph::{NodeId, TensorMeta};
use crate::{DType, Shape};

/// A tensor handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tensor {
    graph: u64,
    node_id: NodeId,
    meta: TensorMeta,
}

impl Tensor {
    pub(crate) fn new(graph: u64, node_id: NodeId, meta: TensorMeta) -> Self {
        Self {
            graph,
            node_id,
            meta,
        }
    }

    /// Id of the graph arena this handle points into.
    pub fn graph_id(&self) -> u64 {
        self.graph
    }

    /// Get the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.meta.shape
    }

    /// Get the tensor dtype.
    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// Number of elements.
    pub fn numel(&self) -> i64 {
        self.meta.shape.numel()
    }

    /// Get the graph node ID.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl std::fmt::Display for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.node_id, self.meta.dtype, self.meta.shape)
    }
}
