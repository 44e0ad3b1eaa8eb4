//! Tensor I/O: host tensors, tensor stores and safetensors files.

use std::path::Path;

use safetensors::tensor::TensorView;

use mlblock_core::{DType, MlbError, Result};

pub mod local;
pub mod store;

pub use local::LocalTensor;
pub use store::{MemoryStore, SafeTensorStore, TensorInfo, TensorStore};

/// Save named host tensors to a safetensors file.
pub fn save_safetensors<'a>(
    path: &Path,
    tensors: impl IntoIterator<Item = (&'a str, &'a LocalTensor)>,
) -> Result<()> {
    let mut views: Vec<(&str, TensorView<'_>)> = Vec::new();
    for (name, tensor) in tensors {
        let shape: Vec<usize> = tensor.shape().0.iter().map(|&d| d as usize).collect();
        let view = TensorView::new(map_dtype_reverse(tensor.dtype()), shape, tensor.as_bytes())
            .map_err(|e| MlbError::Store(format!("`{name}`: {e}")))?;
        views.push((name, view));
    }

    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| MlbError::Store(format!("safetensors save error: {e}")))?;

    Ok(())
}

pub(crate) fn map_dtype(st_dtype: safetensors::Dtype) -> Result<DType> {
    match st_dtype {
        safetensors::Dtype::F32 => Ok(DType::F32),
        safetensors::Dtype::F16 => Ok(DType::F16),
        safetensors::Dtype::BF16 => Ok(DType::BF16),
        safetensors::Dtype::I32 => Ok(DType::I32),
        safetensors::Dtype::I64 => Ok(DType::I64),
        other => Err(MlbError::Store(format!(
            "unsupported safetensors dtype: {other:?}"
        ))),
    }
}

fn map_dtype_reverse(dtype: DType) -> safetensors::Dtype {
    match dtype {
        DType::F32 => safetensors::Dtype::F32,
        DType::F16 => safetensors::Dtype::F16,
        DType::BF16 => safetensors::Dtype::BF16,
        DType::I32 => safetensors::Dtype::I32,
        DType::I64 => safetensors::Dtype::I64,
    }
}
