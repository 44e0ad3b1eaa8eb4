//! Little-endian element codecs between raw tensor bytes and `f32`.
//!
//! Kernels run on `f32`; buffers hold each tensor in its declared dtype.

use half::{bf16, f16};

use crate::{DType, MlbError, Result};

/// Decode `data` (stored as `dtype`) into `f32` values.
pub fn decode_f32(dtype: DType, data: &[u8]) -> Result<Vec<f32>> {
    let size = dtype.size_bytes();
    if data.len() % size != 0 {
        return Err(MlbError::InvalidArgument(format!(
            "{} bytes is not a whole number of {dtype} elements",
            data.len()
        )));
    }
    let out = match dtype {
        DType::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BF16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::I32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        DType::I64 => data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
    };
    Ok(out)
}

/// Encode `src` as `dtype` into `dst`, which must be exactly the right size.
pub fn encode_f32(dtype: DType, src: &[f32], dst: &mut [u8]) -> Result<()> {
    let size = dtype.size_bytes();
    if src.len() * size != dst.len() {
        return Err(MlbError::InvalidArgument(format!(
            "cannot encode {} {dtype} elements into {} bytes",
            src.len(),
            dst.len()
        )));
    }
    for (v, out) in src.iter().zip(dst.chunks_exact_mut(size)) {
        match dtype {
            DType::F32 => out.copy_from_slice(&v.to_le_bytes()),
            DType::F16 => out.copy_from_slice(&f16::from_f32(*v).to_le_bytes()),
            DType::BF16 => out.copy_from_slice(&bf16::from_f32(*v).to_le_bytes()),
            DType::I32 => out.copy_from_slice(&(*v as i32).to_le_bytes()),
            DType::I64 => out.copy_from_slice(&(*v as i64).to_le_bytes()),
        }
    }
    Ok(())
}

/// Convert between floating point encodings.
pub fn convert(from: DType, src: &[u8], to: DType, dst: &mut [u8]) -> Result<()> {
    if from == to {
        if src.len() != dst.len() {
            return Err(MlbError::InvalidArgument(format!(
                "copy of {} bytes into {} bytes",
                src.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(src);
        return Ok(());
    }
    if !from.is_float() || !to.is_float() {
        return Err(MlbError::InvalidArgument(format!(
            "no conversion from {from} to {to}"
        )));
    }
    encode_f32(to, &decode_f32(from, src)?, dst)
}
