//! Reusable model blocks.
//!
//! A block opens a name scope, creates its weights inside it and applies its
//! ops, so `Linear { name: "fc1" }` inside `"mlp"` owns `mlp.fc1.weight`.

use mlblock_core::{Result, Tensor};

use crate::ctx::MlCtx;

/// A named piece of a model.
pub trait Block {
    /// Scope segment the block registers its tensors under.
    fn name(&self) -> &str;

    /// Create weights and ops inside the block's scope.
    fn define(&self, ctx: &mut MlCtx, x: &Tensor) -> Result<Tensor>;

    /// Run [`define`](Block::define) inside `block_begin`/`block_end`. The
    /// scope is closed even when `define` fails.
    fn forward(&self, ctx: &mut MlCtx, x: &Tensor) -> Result<Tensor> {
        ctx.block_begin(self.name())?;
        let out = self.define(ctx, x);
        let closed = ctx.block_end();
        let out = out?;
        closed?;
        Ok(out)
    }
}

/// `y = x @ W + b` with `W: [n_in, n_out]` and `b: [n_out]`.
#[derive(Clone, Debug)]
pub struct Linear {
    pub name: String,
    pub n_in: usize,
    pub n_out: usize,
    pub bias: bool,
}

impl Linear {
    pub fn new(name: impl Into<String>, n_in: usize, n_out: usize) -> Self {
        Self {
            name: name.into(),
            n_in,
            n_out,
            bias: true,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }
}

impl Block for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn define(&self, ctx: &mut MlCtx, x: &Tensor) -> Result<Tensor> {
        let w = ctx.weight_new("weight", [self.n_in as i64, self.n_out as i64])?;
        let b = if self.bias {
            Some(ctx.weight_new("bias", [self.n_out as i64])?)
        } else {
            None
        };
        let g = ctx.ops()?;
        let mut y = g.matmul(x, &w)?;
        if let Some(b) = b {
            y = g.add(&y, &b)?;
        }
        Ok(y)
    }
}

/// Layer normalization over the last dimension with learned scale and shift.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub name: String,
    pub dim: usize,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            dim,
            eps: 1e-5,
        }
    }
}

impl Block for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn define(&self, ctx: &mut MlCtx, x: &Tensor) -> Result<Tensor> {
        let w = ctx.weight_new("weight", [self.dim as i64])?;
        let b = ctx.weight_new("bias", [self.dim as i64])?;
        let g = ctx.ops()?;
        let y = g.layer_norm(x, self.eps)?;
        let y = g.mul(&y, &w)?;
        g.add(&y, &b)
    }
}

/// Two linear layers with a GELU between them.
#[derive(Clone, Debug)]
pub struct Mlp {
    pub name: String,
    pub fc1: Linear,
    pub fc2: Linear,
}

impl Mlp {
    pub fn new(name: impl Into<String>, n_in: usize, n_hidden: usize, n_out: usize) -> Self {
        Self {
            name: name.into(),
            fc1: Linear::new("fc1", n_in, n_hidden),
            fc2: Linear::new("fc2", n_hidden, n_out),
        }
    }
}

impl Block for Mlp {
    fn name(&self) -> &str {
        &self.name
    }

    fn define(&self, ctx: &mut MlCtx, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(ctx, x)?;
        let h = ctx.ops()?.gelu(&h)?;
        ctx.tensor_add("act", &h)?;
        self.fc2.forward(ctx, &h)
    }
}
