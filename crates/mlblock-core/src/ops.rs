//! Shape-checked op builders.
//!
//! Every builder validates its inputs, appends one node to the graph and
//! returns a handle to it. Nothing is computed here. Op results are always
//! `f32`; leaves keep the dtype they were declared with.

use smallvec::SmallVec;

use crate::graph::{Graph, LeafKind, NodeId, OpKind, TensorMeta};
use crate::{DType, MAX_BYTES, MlbError, Result, Shape, Tensor};

/// Maximum rank of any tensor.
pub const MAX_DIMS: usize = 4;

/// Reject metas whose data could not be addressed.
fn sized(meta: TensorMeta) -> Result<TensorMeta> {
    if meta.checked_byte_len().is_none() {
        return Err(MlbError::Capacity {
            what: "tensor bytes",
            limit: MAX_BYTES,
        });
    }
    Ok(meta)
}

impl Graph {
    /// Create a leaf tensor.
    pub fn new_leaf(
        &mut self,
        kind: LeafKind,
        name: &str,
        dtype: DType,
        shape: &Shape,
    ) -> Result<Tensor> {
        if shape.ndim() == 0 || shape.ndim() > MAX_DIMS {
            return Err(MlbError::InvalidArgument(format!(
                "leaf `{name}` has rank {}, expected 1..={MAX_DIMS}",
                shape.ndim()
            )));
        }
        if shape.0.iter().any(|&d| d <= 0) {
            return Err(MlbError::InvalidArgument(format!(
                "leaf `{name}` has non-positive dimension in {shape}"
            )));
        }
        let meta = sized(TensorMeta::new(shape.clone(), dtype))?;
        let id = self.add_node(OpKind::Leaf(kind), SmallVec::new(), meta.clone());
        self.set_name(id, name);
        Ok(Tensor::new(self.id(), id, meta))
    }

    /// Verify that a handle points into this arena.
    pub fn check(&self, t: &Tensor) -> Result<NodeId> {
        if t.graph_id() != self.id() || self.get(t.node_id()).is_none() {
            return Err(MlbError::usage(format!(
                "tensor {t} does not belong to the current graph"
            )));
        }
        Ok(t.node_id())
    }

    fn push_op(&mut self, op: OpKind, inputs: &[&Tensor], shape: Shape) -> Result<Tensor> {
        let mut ids: SmallVec<[NodeId; 2]> = SmallVec::new();
        for t in inputs {
            ids.push(self.check(t)?);
        }
        let meta = sized(TensorMeta::new(shape, DType::F32))?;
        let id = self.add_node(op, ids, meta.clone());
        Ok(Tensor::new(self.id(), id, meta))
    }

    fn binary(&mut self, op: OpKind, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let shape = Shape::broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
            MlbError::ShapeMismatch {
                expected: a.shape().0.clone(),
                got: b.shape().0.clone(),
            }
        })?;
        self.push_op(op, &[a, b], shape)
    }

    fn unary(&mut self, op: OpKind, a: &Tensor) -> Result<Tensor> {
        let shape = a.shape().clone();
        self.push_op(op, &[a], shape)
    }

    // ── Elementwise ops ─────────────────────────────────────────────────

    /// Element-wise addition (numpy-style broadcasting).
    pub fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(OpKind::Add, a, b)
    }

    pub fn sub(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(OpKind::Sub, a, b)
    }

    pub fn mul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(OpKind::Mul, a, b)
    }

    pub fn div(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        self.binary(OpKind::Div, a, b)
    }

    pub fn neg(&mut self, a: &Tensor) -> Result<Tensor> {
        self.unary(OpKind::Neg, a)
    }

    pub fn exp(&mut self, a: &Tensor) -> Result<Tensor> {
        self.unary(OpKind::Exp, a)
    }

    pub fn sqrt(&mut self, a: &Tensor) -> Result<Tensor> {
        self.unary(OpKind::Sqrt, a)
    }

    // ── Reductions ──────────────────────────────────────────────────────

    /// Sum along an axis, or over everything when `axis` is `None`.
    pub fn sum(&mut self, a: &Tensor, axis: Option<i32>) -> Result<Tensor> {
        let shape = reduced_shape(a.shape(), axis)?;
        self.push_op(OpKind::Sum { axis }, &[a], shape)
    }

    /// Mean along an axis, or over everything when `axis` is `None`.
    pub fn mean(&mut self, a: &Tensor, axis: Option<i32>) -> Result<Tensor> {
        let shape = reduced_shape(a.shape(), axis)?;
        self.push_op(OpKind::Mean { axis }, &[a], shape)
    }

    // ── Linear algebra ──────────────────────────────────────────────────

    /// Matrix multiplication `[m, k] @ [k, n] -> [m, n]`.
    pub fn matmul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        if a.shape().ndim() != 2 || b.shape().ndim() != 2 {
            return Err(MlbError::InvalidArgument(
                "matmul requires 2D tensors".to_string(),
            ));
        }
        let m = a.shape().0[0];
        let k = a.shape().0[1];
        let k2 = b.shape().0[0];
        let n = b.shape().0[1];
        if k != k2 {
            return Err(MlbError::ShapeMismatch {
                expected: a.shape().0.clone(),
                got: b.shape().0.clone(),
            });
        }
        self.push_op(OpKind::MatMul, &[a, b], Shape::new(vec![m, n]))
    }

    // ── Shape manipulation ──────────────────────────────────────────────

    pub fn reshape(&mut self, a: &Tensor, new_shape: &Shape) -> Result<Tensor> {
        if a.numel() != new_shape.numel() {
            return Err(MlbError::ShapeMismatch {
                expected: a.shape().0.clone(),
                got: new_shape.0.clone(),
            });
        }
        self.push_op(
            OpKind::Reshape {
                new_shape: new_shape.clone(),
            },
            &[a],
            new_shape.clone(),
        )
    }

    /// Transpose (reverses axes by default, or use the given permutation).
    pub fn transpose(&mut self, a: &Tensor, axes: Option<&[usize]>) -> Result<Tensor> {
        let ndim = a.shape().ndim();
        let perm: Vec<usize> = match axes {
            Some(ax) => {
                let mut seen = vec![false; ndim];
                if ax.len() != ndim || ax.iter().any(|&i| i >= ndim || std::mem::replace(&mut seen[i], true)) {
                    return Err(MlbError::InvalidArgument(format!(
                        "invalid transpose permutation {ax:?} for rank {ndim}"
                    )));
                }
                ax.to_vec()
            }
            None => (0..ndim).rev().collect(),
        };
        let new_dims: Vec<i64> = perm.iter().map(|&ax| a.shape().0[ax]).collect();
        self.push_op(
            OpKind::Transpose { axes: Some(perm) },
            &[a],
            Shape::new(new_dims),
        )
    }

    /// Broadcast to the target shape (numpy-style rules).
    pub fn broadcast_to(&mut self, a: &Tensor, target: &Shape) -> Result<Tensor> {
        match Shape::broadcast_shapes(a.shape(), target) {
            Some(s) if &s == target => self.push_op(
                OpKind::Broadcast {
                    target_shape: target.clone(),
                },
                &[a],
                target.clone(),
            ),
            _ => Err(MlbError::InvalidArgument(format!(
                "cannot broadcast shape {} to {}",
                a.shape(),
                target
            ))),
        }
    }

    // ── Activations ─────────────────────────────────────────────────────

    pub fn softmax(&mut self, a: &Tensor, axis: i32) -> Result<Tensor> {
        normalize_axis(axis, a.shape().ndim())?;
        self.unary(OpKind::Softmax { axis }, a)
    }

    pub fn silu(&mut self, a: &Tensor) -> Result<Tensor> {
        self.unary(OpKind::Silu, a)
    }

    pub fn gelu(&mut self, a: &Tensor) -> Result<Tensor> {
        self.unary(OpKind::Gelu, a)
    }

    // ── Normalization ───────────────────────────────────────────────────

    /// Layer normalization over the last dimension (no affine terms).
    pub fn layer_norm(&mut self, a: &Tensor, eps: f32) -> Result<Tensor> {
        self.unary(OpKind::LayerNorm { eps }, a)
    }

    /// RMS normalization over the last dimension.
    pub fn rms_norm(&mut self, a: &Tensor, eps: f32) -> Result<Tensor> {
        self.unary(OpKind::RmsNorm { eps }, a)
    }
}

/// Resolve a possibly negative axis against `ndim`.
pub fn normalize_axis(axis: i32, ndim: usize) -> Result<usize> {
    let n = ndim as i32;
    let ax = if axis < 0 { n + axis } else { axis };
    if ax < 0 || ax >= n {
        return Err(MlbError::InvalidArgument(format!(
            "axis {axis} out of range for ndim {ndim}"
        )));
    }
    Ok(ax as usize)
}

fn reduced_shape(shape: &Shape, axis: Option<i32>) -> Result<Shape> {
    let Some(axis) = axis else {
        return Ok(Shape::new(vec![1]));
    };
    let ax = normalize_axis(axis, shape.ndim())?;
    let mut dims = shape.0.clone();
    dims.remove(ax);
    if dims.is_empty() {
        dims.push(1);
    }
    Ok(Shape::new(dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(g: &mut Graph, name: &str, dims: &[i64]) -> Tensor {
        g.new_leaf(LeafKind::Param, name, DType::F16, &Shape::from(dims))
            .unwrap()
    }

    #[test]
    fn test_leaf_rank_limits() {
        let mut g = Graph::new();
        assert!(g
            .new_leaf(LeafKind::Input, "x", DType::F32, &Shape::from([1, 2, 3, 4, 5]))
            .is_err());
        assert!(g
            .new_leaf(LeafKind::Input, "x", DType::F32, &Shape::scalar())
            .is_err());
        let t = leaf(&mut g, "w", &[2, 2, 2, 2]);
        assert_eq!(t.dtype(), DType::F16);
        assert_eq!(g.name(t.node_id()), Some("w"));
    }

    #[test]
    fn test_oversized_tensors_are_rejected() {
        let mut g = Graph::new();
        let err = g
            .new_leaf(LeafKind::Param, "w", DType::F32, &Shape::from([1 << 32, 1 << 32]))
            .unwrap_err();
        assert!(matches!(err, MlbError::Capacity { what: "tensor bytes", .. }));
        assert_eq!(g.len(), 0);

        // Each factor fits, the product does not.
        let a = leaf(&mut g, "a", &[1 << 31, 1]);
        let b = leaf(&mut g, "b", &[1, 1 << 31]);
        assert!(matches!(g.matmul(&a, &b), Err(MlbError::Capacity { .. })));
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_add_broadcasts_bias() {
        let mut g = Graph::new();
        let x = leaf(&mut g, "x", &[3, 4]);
        let b = leaf(&mut g, "b", &[4]);
        let y = g.add(&x, &b).unwrap();
        assert_eq!(y.shape(), &Shape::from([3, 4]));
        assert_eq!(y.dtype(), DType::F32);

        let bad = leaf(&mut g, "c", &[3]);
        assert!(matches!(
            g.add(&x, &bad),
            Err(MlbError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul_shapes() {
        let mut g = Graph::new();
        let a = leaf(&mut g, "a", &[2, 3]);
        let b = leaf(&mut g, "b", &[3, 5]);
        assert_eq!(g.matmul(&a, &b).unwrap().shape(), &Shape::from([2, 5]));
        assert!(g.matmul(&b, &a).is_err());
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let mut g1 = Graph::new();
        let mut g2 = Graph::new();
        let a = leaf(&mut g1, "a", &[2]);
        let _ = leaf(&mut g2, "b", &[2]);
        assert!(matches!(g2.neg(&a), Err(MlbError::Usage(_))));
    }

    #[test]
    fn test_transpose_rejects_bad_permutation() {
        let mut g = Graph::new();
        let a = leaf(&mut g, "a", &[2, 3]);
        assert!(g.transpose(&a, Some(&[0, 0])).is_err());
        let t = g.transpose(&a, None).unwrap();
        assert_eq!(t.shape(), &Shape::from([3, 2]));
    }

    #[test]
    fn test_reductions() {
        let mut g = Graph::new();
        let a = leaf(&mut g, "a", &[2, 3]);
        assert_eq!(g.sum(&a, Some(-1)).unwrap().shape(), &Shape::from([2]));
        assert_eq!(g.mean(&a, None).unwrap().shape(), &Shape::from([1]));
        assert!(g.sum(&a, Some(2)).is_err());
    }
}
