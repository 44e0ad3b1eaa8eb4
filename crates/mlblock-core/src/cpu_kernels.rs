//! CPU reference backend.
//!
//! A simple, safe Rust implementation of every op. It favors correctness and
//! readability over speed and doubles as the default backend. A memory limit
//! can be set to exercise allocation failures, and a backend can be declared
//! non-host to exercise the upload path.

use crate::backend::{Backend, NodeInput};
use crate::graph::{OpKind, TensorMeta};
use crate::ops::normalize_axis;
use crate::{MlbError, Result, Shape};

/// Reference CPU backend.
#[derive(Clone, Debug)]
pub struct CpuBackend {
    name: String,
    host: bool,
    max_buffer: Option<usize>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::named("cpu")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: true,
            max_buffer: None,
        }
    }

    /// Refuse any single buffer larger than `bytes`.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.max_buffer = Some(bytes);
        self
    }

    /// Pretend the buffers live in device memory.
    pub fn as_device(mut self) -> Self {
        self.host = false;
        self
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_host(&self) -> bool {
        self.host
    }

    fn max_buffer_size(&self) -> Option<usize> {
        self.max_buffer
    }

    fn eval_node(
        &self,
        op: &OpKind,
        inputs: &[NodeInput<'_>],
        output_meta: &TensorMeta,
    ) -> Result<Vec<f32>> {
        match op {
            OpKind::Leaf(_) => Err(MlbError::InvalidArgument(
                "leaf nodes are bound, not evaluated".into(),
            )),
            OpKind::Add => binary_elementwise(inputs, &output_meta.shape, |a, b| a + b),
            OpKind::Sub => binary_elementwise(inputs, &output_meta.shape, |a, b| a - b),
            OpKind::Mul => binary_elementwise(inputs, &output_meta.shape, |a, b| a * b),
            OpKind::Div => binary_elementwise(inputs, &output_meta.shape, |a, b| a / b),
            OpKind::Neg => unary(inputs, |x| -x),
            OpKind::Exp => unary(inputs, f32::exp),
            OpKind::Sqrt => unary(inputs, f32::sqrt),
            OpKind::Sum { axis } => reduce(inputs, *axis, |slice| slice.iter().sum()),
            OpKind::Mean { axis } => reduce(inputs, *axis, |slice| {
                slice.iter().sum::<f32>() / slice.len().max(1) as f32
            }),
            OpKind::MatMul => matmul(inputs),
            OpKind::Reshape { .. } => {
                let a = require_input(inputs, 0)?;
                Ok(a.data.to_vec())
            }
            OpKind::Transpose { axes } => transpose(inputs, axes.as_deref()),
            OpKind::Broadcast { target_shape } => {
                let a = require_input(inputs, 0)?;
                Ok(expand(a, target_shape))
            }
            OpKind::Softmax { axis } => softmax(inputs, *axis),
            OpKind::Silu => unary(inputs, |x| x * sigmoid(x)),
            OpKind::Gelu => unary(inputs, |x| {
                0.5 * x
                    * (1.0
                        + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x))
                            .tanh())
            }),
            OpKind::LayerNorm { eps } => last_dim_rows(inputs, |row, out| {
                let n = row.len() as f32;
                let mean = row.iter().sum::<f32>() / n;
                let var = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
                let std = (var + eps).sqrt();
                for (o, &x) in out.iter_mut().zip(row) {
                    *o = (x - mean) / std;
                }
            }),
            OpKind::RmsNorm { eps } => last_dim_rows(inputs, |row, out| {
                let n = row.len() as f32;
                let rms = (row.iter().map(|x| x * x).sum::<f32>() / n + eps).sqrt();
                for (o, &x) in out.iter_mut().zip(row) {
                    *o = x / rms;
                }
            }),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn require_input<'a>(inputs: &'a [NodeInput<'_>], idx: usize) -> Result<&'a NodeInput<'a>> {
    inputs
        .get(idx)
        .ok_or_else(|| MlbError::InvalidArgument(format!("expected input at index {idx}")))
}

fn unary(inputs: &[NodeInput<'_>], f: impl Fn(f32) -> f32) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    Ok(a.data.iter().map(|&x| f(x)).collect())
}

/// Expand `a` to `out_shape` following numpy broadcasting rules.
fn expand(a: &NodeInput<'_>, out_shape: &Shape) -> Vec<f32> {
    let in_shape = &a.shape.0;
    let out_dims = &out_shape.0;
    if in_shape == out_dims {
        return a.data.to_vec();
    }
    let out_ndim = out_dims.len();
    let pad = out_ndim - in_shape.len();
    let total = out_shape.numel() as usize;

    let mut result = vec![0.0f32; total];
    for (out_flat, out) in result.iter_mut().enumerate() {
        let mut remaining = out_flat;
        let mut in_flat = 0usize;
        let mut in_stride = 1usize;

        for d in (0..out_ndim).rev() {
            let out_dim = out_dims[d] as usize;
            let coord = remaining % out_dim;
            remaining /= out_dim;

            if d >= pad {
                let in_dim = in_shape[d - pad] as usize;
                let in_coord = if in_dim == 1 { 0 } else { coord };
                in_flat += in_coord * in_stride;
                in_stride *= in_dim;
            }
        }
        *out = a.data[in_flat];
    }
    result
}

fn binary_elementwise(
    inputs: &[NodeInput<'_>],
    out_shape: &Shape,
    f: fn(f32, f32) -> f32,
) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let b = require_input(inputs, 1)?;
    if Shape::broadcast_shapes(a.shape, b.shape).as_ref() != Some(out_shape) {
        return Err(MlbError::ShapeMismatch {
            expected: a.shape.0.clone(),
            got: b.shape.0.clone(),
        });
    }
    let lhs = expand(a, out_shape);
    let rhs = expand(b, out_shape);
    Ok(lhs.iter().zip(rhs.iter()).map(|(&x, &y)| f(x, y)).collect())
}

fn reduce(
    inputs: &[NodeInput<'_>],
    axis: Option<i32>,
    reducer: impl Fn(&[f32]) -> f32,
) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let Some(axis) = axis else {
        return Ok(vec![reducer(a.data)]);
    };
    let ax = normalize_axis(axis, a.shape.ndim())?;

    let outer: usize = a.shape.0[..ax].iter().product::<i64>() as usize;
    let dim: usize = a.shape.0[ax] as usize;
    let inner: usize = a.shape.0[ax + 1..].iter().product::<i64>() as usize;

    let mut result = Vec::with_capacity(outer * inner);
    let mut slice = Vec::with_capacity(dim);
    for o in 0..outer {
        for i in 0..inner {
            slice.clear();
            for d in 0..dim {
                slice.push(a.data[o * dim * inner + d * inner + i]);
            }
            result.push(reducer(&slice));
        }
    }
    Ok(result)
}

fn matmul(inputs: &[NodeInput<'_>]) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let b = require_input(inputs, 1)?;

    if a.shape.ndim() != 2 || b.shape.ndim() != 2 {
        return Err(MlbError::InvalidArgument(
            "matmul requires 2D tensors".into(),
        ));
    }

    let m = a.shape.0[0] as usize;
    let k = a.shape.0[1] as usize;
    let k2 = b.shape.0[0] as usize;
    let n = b.shape.0[1] as usize;

    if k != k2 {
        return Err(MlbError::ShapeMismatch {
            expected: vec![m as i64, k as i64],
            got: vec![k2 as i64, n as i64],
        });
    }

    let mut data = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let av = a.data[i * k + p];
            for j in 0..n {
                data[i * n + j] += av * b.data[p * n + j];
            }
        }
    }
    Ok(data)
}

fn transpose(inputs: &[NodeInput<'_>], axes: Option<&[usize]>) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let ndim = a.shape.ndim();

    let perm: Vec<usize> = match axes {
        Some(ax) => ax.to_vec(),
        None => (0..ndim).rev().collect(),
    };

    if perm.len() != ndim {
        return Err(MlbError::InvalidArgument(
            "transpose axes length must match ndim".into(),
        ));
    }

    let old_shape: Vec<usize> = a.shape.0.iter().map(|&d| d as usize).collect();
    let new_shape: Vec<usize> = perm.iter().map(|&ax| old_shape[ax]).collect();

    let mut old_strides = vec![1usize; ndim];
    for i in (0..ndim.saturating_sub(1)).rev() {
        old_strides[i] = old_strides[i + 1] * old_shape[i + 1];
    }

    let mut result = vec![0.0f32; a.data.len()];
    for (flat, out) in result.iter_mut().enumerate() {
        let mut remaining = flat;
        let mut old_flat = 0;
        for dim_idx in 0..ndim {
            let block: usize = new_shape[dim_idx + 1..].iter().product::<usize>().max(1);
            let coord = remaining / block;
            remaining %= block;
            old_flat += coord * old_strides[perm[dim_idx]];
        }
        *out = a.data[old_flat];
    }

    Ok(result)
}

fn softmax(inputs: &[NodeInput<'_>], axis: i32) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let ax = normalize_axis(axis, a.shape.ndim())?;

    let outer: usize = a.shape.0[..ax].iter().product::<i64>() as usize;
    let dim: usize = a.shape.0[ax] as usize;
    let inner: usize = a.shape.0[ax + 1..].iter().product::<i64>() as usize;

    let mut data = a.data.to_vec();
    for o in 0..outer {
        for i in 0..inner {
            let idx = |d: usize| o * dim * inner + d * inner + i;
            let max_val = (0..dim)
                .map(|d| data[idx(d)])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut sum_exp = 0.0f32;
            for d in 0..dim {
                let e = (data[idx(d)] - max_val).exp();
                data[idx(d)] = e;
                sum_exp += e;
            }
            for d in 0..dim {
                data[idx(d)] /= sum_exp;
            }
        }
    }
    Ok(data)
}

/// Apply `f` to every row along the last dimension.
fn last_dim_rows(inputs: &[NodeInput<'_>], f: impl Fn(&[f32], &mut [f32])) -> Result<Vec<f32>> {
    let a = require_input(inputs, 0)?;
    let Some(&last) = a.shape.0.last() else {
        return Ok(a.data.to_vec());
    };
    let last = last as usize;
    let mut result = vec![0.0f32; a.data.len()];
    for (row, out) in a.data.chunks(last).zip(result.chunks_mut(last)) {
        f(row, out);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    fn meta(shape: Vec<i64>) -> TensorMeta {
        TensorMeta::new(Shape::new(shape), DType::F32)
    }

    fn input<'a>(data: &'a [f32], shape: &'a Shape) -> NodeInput<'a> {
        NodeInput {
            data,
            shape,
            dtype: DType::F32,
        }
    }

    #[test]
    fn test_add_with_bias_broadcast() {
        let backend = CpuBackend::new();
        let (sa, sb) = (Shape::from([2, 3]), Shape::from([3]));
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [10.0, 20.0, 30.0];
        let result = backend
            .eval_node(&OpKind::Add, &[input(&a, &sa), input(&b, &sb)], &meta(vec![2, 3]))
            .unwrap();
        assert_eq!(result, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_matmul() {
        let backend = CpuBackend::new();
        let s = Shape::from([2, 2]);
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let result = backend
            .eval_node(&OpKind::MatMul, &[input(&a, &s), input(&b, &s)], &meta(vec![2, 2]))
            .unwrap();
        assert_eq!(result, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let backend = CpuBackend::new();
        let s = Shape::from([3]);
        let data = [1.0, 2.0, 3.0];
        let result = backend
            .eval_node(&OpKind::Softmax { axis: 0 }, &[input(&data, &s)], &meta(vec![3]))
            .unwrap();
        let sum: f32 = result.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result[0] < result[1] && result[1] < result[2]);
    }

    #[test]
    fn test_layer_norm_rows() {
        let backend = CpuBackend::new();
        let s = Shape::from([2, 3]);
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let result = backend
            .eval_node(&OpKind::LayerNorm { eps: 1e-5 }, &[input(&data, &s)], &meta(vec![2, 3]))
            .unwrap();
        let row1_mean: f32 = result[0..3].iter().sum::<f32>() / 3.0;
        assert!(row1_mean.abs() < 1e-5);
        assert!((result[2] - result[5]).abs() < 1e-6);
    }

    #[test]
    fn test_reduce_sum_axis() {
        let backend = CpuBackend::new();
        let s = Shape::from([2, 3]);
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let result = backend
            .eval_node(&OpKind::Sum { axis: Some(0) }, &[input(&data, &s)], &meta(vec![3]))
            .unwrap();
        assert_eq!(result, vec![5.0, 7.0, 9.0]);
        let mean = backend
            .eval_node(&OpKind::Mean { axis: None }, &[input(&data, &s)], &meta(vec![1]))
            .unwrap();
        assert_eq!(mean, vec![3.5]);
    }

    #[test]
    fn test_transpose() {
        let backend = CpuBackend::new();
        let s = Shape::from([2, 3]);
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let result = backend
            .eval_node(&OpKind::Transpose { axes: None }, &[input(&data, &s)], &meta(vec![3, 2]))
            .unwrap();
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_silu() {
        let backend = CpuBackend::new();
        let s = Shape::from([3]);
        let data = [0.0, 1.0, -1.0];
        let result = backend
            .eval_node(&OpKind::Silu, &[input(&data, &s)], &meta(vec![3]))
            .unwrap();
        assert!((result[1] - 0.7311).abs() < 1e-3);
        assert!((result[2] - (-0.2689)).abs() < 1e-3);
    }

    #[test]
    fn test_leaf_is_not_evaluated() {
        let backend = CpuBackend::new();
        let op = OpKind::Leaf(crate::LeafKind::Param);
        assert!(backend.eval_node(&op, &[], &meta(vec![1])).is_err());
    }
}
