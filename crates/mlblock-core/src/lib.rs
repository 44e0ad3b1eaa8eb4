//! Graph engine underneath `mlblock`.
//!
//! `mlblock-core` provides the foundational types (`DType`, `Shape`, `Tensor`),
//! a graph arena with shape-checked op builders, a pluggable `Backend` trait
//! with a CPU reference implementation, and the planning and execution
//! machinery the computation controller drives:
//!
//! - [`schedule`]: the reachable subgraph for a result, in creation order
//! - [`alloc`]: parameter layout and liveness-based compute slot planning
//! - [`exec`]: runs a planned graph over per-backend buffers
//! - [`intern`]: the string interner used for tensor names and store keys

pub mod alloc;
pub mod backend;
pub mod codec;
pub mod cpu_kernels;
pub mod dump;
pub mod exec;
pub mod graph;
pub mod intern;
pub mod ops;
pub mod schedule;
pub mod tensor;
pub mod types;

pub use backend::Backend;
pub use cpu_kernels::CpuBackend;
pub use graph::{Graph, LeafKind, NodeId, OpKind, TensorMeta};
pub use intern::{StringId, StringStore};
pub use tensor::Tensor;
pub use types::{DType, MAX_BYTES, Shape};

pub type Result<T> = std::result::Result<T, MlbError>;

/// Error category, following the failure taxonomy of a computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation called out of sequence or with a bad argument.
    Usage,
    /// A configured maximum was exceeded.
    Capacity,
    /// A parameter could not be resolved against the tensor store.
    Resolution,
    /// A backend could not satisfy a buffer request.
    Allocation,
    /// A kernel or backend failed while computing.
    Execution,
    /// I/O or store format failure.
    Io,
}

#[derive(thiserror::Error, Debug)]
pub enum MlbError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("capacity exceeded: {what} (limit {limit})")]
    Capacity { what: &'static str, limit: usize },

    #[error("tensor `{0}` not found in tensor store")]
    MissingKey(String),

    #[error("tensor `{key}`: store has {stored_dtype} {stored_shape}, graph expects {dtype} {shape}")]
    LoadMismatch {
        key: String,
        stored_dtype: DType,
        stored_shape: Shape,
        dtype: DType,
        shape: Shape,
    },

    #[error("backend `{backend}` cannot allocate {requested} bytes for the {pool} pool")]
    Allocation {
        backend: String,
        pool: &'static str,
        requested: usize,
    },

    #[error("backend `{backend}` failed on {op} `{node}`: {source}")]
    Execution {
        backend: String,
        op: &'static str,
        node: String,
        #[source]
        source: Box<MlbError>,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("graph error: {0}")]
    Graph(&'static str),

    #[error("tensor store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MlbError {
    pub fn usage(msg: impl Into<String>) -> Self {
        MlbError::Usage(msg.into())
    }

    /// Taxonomy category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MlbError::Usage(_) | MlbError::Graph(_) => ErrorKind::Usage,
            MlbError::ShapeMismatch { .. } | MlbError::InvalidArgument(_) => ErrorKind::Usage,
            MlbError::Capacity { .. } => ErrorKind::Capacity,
            MlbError::MissingKey(_) | MlbError::LoadMismatch { .. } => ErrorKind::Resolution,
            MlbError::Allocation { .. } => ErrorKind::Allocation,
            MlbError::Execution { .. } => ErrorKind::Execution,
            MlbError::Store(_) | MlbError::Io(_) => ErrorKind::Io,
        }
    }
}
