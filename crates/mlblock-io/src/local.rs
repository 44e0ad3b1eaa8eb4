//! Host tensor container.

use mlblock_core::codec::{decode_f32, encode_f32};
use mlblock_core::{DType, MlbError, Result, Shape};

/// A dense tensor living in host memory, stored little-endian in its dtype.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalTensor {
    dtype: DType,
    shape: Shape,
    data: Vec<u8>,
}

impl LocalTensor {
    /// Wrap raw little-endian bytes.
    pub fn new(dtype: DType, shape: Shape, data: Vec<u8>) -> Result<Self> {
        if shape.byte_len(dtype) != Some(data.len()) {
            return Err(MlbError::InvalidArgument(format!(
                "{} bytes do not hold a {dtype} tensor of shape {shape}",
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Result<Self> {
        let len = shape.byte_len(dtype).ok_or_else(|| {
            MlbError::InvalidArgument(format!("a {dtype} tensor of shape {shape} is too large"))
        })?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| {
            MlbError::InvalidArgument(format!("cannot reserve {len} bytes for a tensor of shape {shape}"))
        })?;
        data.resize(len, 0);
        Ok(Self { dtype, shape, data })
    }

    /// Build an `f32` tensor from values.
    pub fn from_f32(shape: impl Into<Shape>, values: &[f32]) -> Result<Self> {
        Self::from_f32_as(DType::F32, shape, values)
    }

    /// Build a tensor of `dtype` from `f32` values.
    pub fn from_f32_as(dtype: DType, shape: impl Into<Shape>, values: &[f32]) -> Result<Self> {
        let shape = shape.into();
        if shape.checked_numel() != Some(values.len() as i64) {
            return Err(MlbError::ShapeMismatch {
                expected: shape.0.clone(),
                got: vec![values.len() as i64],
            });
        }
        let mut t = Self::zeros(dtype, shape)?;
        encode_f32(dtype, values, &mut t.data)?;
        Ok(t)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        decode_f32(self.dtype, &self.data)
    }
}
