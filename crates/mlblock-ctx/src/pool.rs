//! Per-backend memory pools.

use std::sync::Arc;

use tracing::debug;

use mlblock_core::alloc::Buffer;
use mlblock_core::{Backend, Result};

/// How long a pool lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifetime {
    /// Released right after one compute.
    Invocation,
    /// Released at `end`.
    Computation,
    /// Survives `end` and is handed to the next matching computation.
    Resident,
}

/// One arena per backend.
#[derive(Debug)]
pub struct Pool {
    kind: &'static str,
    lifetime: Lifetime,
    buffers: Vec<Buffer>,
}

impl Pool {
    /// Allocate `sizes[i]` bytes on `backends[i]` for every backend.
    pub fn allocate(
        kind: &'static str,
        lifetime: Lifetime,
        backends: &[Arc<dyn Backend>],
        sizes: &[usize],
    ) -> Result<Self> {
        let mut buffers = Vec::with_capacity(sizes.len());
        for (i, (backend, &size)) in backends.iter().zip(sizes).enumerate() {
            buffers.push(Buffer::new(backend.as_ref(), i, kind, size)?);
        }
        debug!(pool = kind, ?lifetime, ?sizes, "allocated pool");
        Ok(Self {
            kind,
            lifetime,
            buffers,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn set_lifetime(&mut self, lifetime: Lifetime) {
        self.lifetime = lifetime;
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    /// Total bytes over all backends.
    pub fn size(&self) -> usize {
        self.buffers.iter().map(Buffer::size).sum()
    }

    /// `(base address, size)` of every arena.
    pub fn layout(&self) -> Vec<(usize, usize)> {
        self.buffers
            .iter()
            .map(|b| (b.base_addr(), b.size()))
            .collect()
    }
}
