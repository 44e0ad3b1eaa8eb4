//! Computation graph arena.
//!
//! Nodes are appended as tensors are created and never removed, so creation
//! order is always a valid topological order. Leaves carry a [`LeafKind`];
//! everything else is produced by an [`OpKind`] from earlier nodes.

use crate::types::{DType, MAX_BYTES, Shape};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a node in the graph arena (its creation index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Metadata about a tensor (known before materialization).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    /// Bytes needed to hold the tensor data, saturating at [`MAX_BYTES`].
    /// Graph builders reject metas that do not fit.
    pub fn byte_len(&self) -> usize {
        self.checked_byte_len().unwrap_or(MAX_BYTES)
    }

    pub fn checked_byte_len(&self) -> Option<usize> {
        self.shape.byte_len(self.dtype)
    }
}

/// What a leaf node is fed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeafKind {
    /// Loaded from the tensor store once per computation.
    Param,
    /// Bound by the caller before every compute.
    Input,
}

/// A node in the computation graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub op: OpKind,
    pub inputs: SmallVec<[NodeId; 2]>,
    pub meta: TensorMeta,
    pub name: String,
}

impl Node {
    pub fn leaf_kind(&self) -> Option<LeafKind> {
        match self.op {
            OpKind::Leaf(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.op, OpKind::Leaf(_))
    }
}

/// The set of operations supported by the graph.
#[derive(Clone, Debug, PartialEq)]
pub enum OpKind {
    // ── Sources ─────────────────────────────────────────────────────────
    /// No producing op; data comes from the store or the caller.
    Leaf(LeafKind),

    // ── Elementwise ─────────────────────────────────────────────────────
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Sqrt,

    // ── Reductions ──────────────────────────────────────────────────────
    Sum { axis: Option<i32> },
    Mean { axis: Option<i32> },

    // ── Linear algebra ──────────────────────────────────────────────────
    MatMul,

    // ── Shape manipulation ──────────────────────────────────────────────
    Reshape { new_shape: Shape },
    Transpose { axes: Option<Vec<usize>> },
    /// Broadcast a tensor to a target shape (numpy-style rules).
    Broadcast { target_shape: Shape },

    // ── Activations ─────────────────────────────────────────────────────
    Softmax { axis: i32 },
    Silu,
    Gelu,

    // ── Normalization ───────────────────────────────────────────────────
    LayerNorm { eps: f32 },
    RmsNorm { eps: f32 },
}

impl OpKind {
    /// Short lowercase name used in logs and graph dumps.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Leaf(LeafKind::Param) => "param",
            OpKind::Leaf(LeafKind::Input) => "input",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Exp => "exp",
            OpKind::Sqrt => "sqrt",
            OpKind::Sum { .. } => "sum",
            OpKind::Mean { .. } => "mean",
            OpKind::MatMul => "matmul",
            OpKind::Reshape { .. } => "reshape",
            OpKind::Transpose { .. } => "transpose",
            OpKind::Broadcast { .. } => "broadcast",
            OpKind::Softmax { .. } => "softmax",
            OpKind::Silu => "silu",
            OpKind::Gelu => "gelu",
            OpKind::LayerNorm { .. } => "layer_norm",
            OpKind::RmsNorm { .. } => "rms_norm",
        }
    }
}

/// The computation graph arena.
#[derive(Debug)]
pub struct Graph {
    id: u64,
    nodes: Vec<Node>,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
        }
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-unique id of this arena; tensor handles remember it.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Add a node and return its ID.
    pub fn add_node(
        &mut self,
        op: OpKind,
        inputs: SmallVec<[NodeId; 2]>,
        meta: TensorMeta,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            op,
            inputs,
            meta,
            name: String::new(),
        });
        id
    }

    /// Get a node by ID.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Get a node by ID, failing with a graph error if it is not in this arena.
    pub fn node(&self, id: NodeId) -> crate::Result<&Node> {
        self.get(id)
            .ok_or(crate::MlbError::Graph("node is not part of this graph"))
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.get(id).map(|n| n.name.as_str())
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.name = name.into();
        }
    }

    /// Iterate every node in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Iterate the leaf nodes in creation order.
    pub fn leaves(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
