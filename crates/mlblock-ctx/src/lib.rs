//! Computation contexts.
//!
//! An [`MlCtx`] owns the backends and memory pools for a sequence of
//! computations. Each computation defines tensors under hierarchical names,
//! seals the graph, loads parameters by name from a
//! [`TensorStore`](mlblock_io::TensorStore), binds inputs and computes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mlblock_core::{CpuBackend, DType, StringStore};
//! use mlblock_ctx::{Block, Linear, MlCtx};
//! use mlblock_io::{LocalTensor, MemoryStore};
//!
//! # fn main() -> mlblock_core::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let mut ctx = MlCtx::new(Arc::new(CpuBackend::new()), Arc::new(StringStore::new()))
//!     .with_store(store);
//! let x = LocalTensor::from_f32([1, 4], &[1.0, 2.0, 3.0, 4.0])?;
//! let y = ctx.run("linear", &[&x], |ctx, inputs| {
//!     Linear::new("fc", 4, 4).forward(ctx, &inputs[0])
//! })?;
//! # let _ = y;
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod config;
pub mod ctx;
pub mod loader;
pub mod planner;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod stats;

pub use blocks::{Block, LayerNorm, Linear, Mlp};
pub use config::{Config, CtxFlags, ParamResidency};
pub use ctx::{EntryView, MlCtx, Phase};
pub use loader::LoadReport;
pub use pool::Lifetime;
pub use registry::EntryKind;
pub use stats::Stats;
