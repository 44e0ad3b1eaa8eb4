//! Keyed tensor stores the loader reads parameters from.

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::debug;

use mlblock_core::{DType, MAX_BYTES, MlbError, Result, Shape};

use crate::local::LocalTensor;
use crate::map_dtype;

/// Dtype and shape of a stored tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorInfo {
    /// Size of the stored data, saturating at [`MAX_BYTES`].
    pub fn byte_len(&self) -> usize {
        self.shape.byte_len(self.dtype).unwrap_or(MAX_BYTES)
    }
}

/// Read-only, keyed access to stored tensors.
pub trait TensorStore: Send + Sync {
    /// Dtype and shape of `key`, or `None` if the store lacks it.
    fn info(&self, key: &str) -> Option<TensorInfo>;

    /// Copy the raw bytes of `key` into `dst`, which must be exactly
    /// `info(key).byte_len()` bytes.
    fn read(&self, key: &str, dst: &mut [u8]) -> Result<()>;

    /// Every key, sorted.
    fn keys(&self) -> Vec<String>;
}

fn check_len(key: &str, have: usize, dst: &[u8]) -> Result<()> {
    if have != dst.len() {
        return Err(MlbError::Store(format!(
            "`{key}` holds {have} bytes, destination has {}",
            dst.len()
        )));
    }
    Ok(())
}

// ── In-memory store ─────────────────────────────────────────────────────

/// A store backed by host tensors.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    tensors: HashMap<String, LocalTensor>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: LocalTensor) -> Option<LocalTensor> {
        self.tensors.insert(key.into(), tensor)
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, tensor: LocalTensor) -> Self {
        self.insert(key, tensor);
        self
    }

    pub fn get(&self, key: &str) -> Option<&LocalTensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Load every tensor of a safetensors file into memory.
    pub fn from_safetensors(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let st = SafeTensors::deserialize(&data)
            .map_err(|e| MlbError::Store(format!("safetensors parse error: {e}")))?;
        let mut store = Self::new();
        for (name, view) in st.tensors() {
            let dtype = map_dtype(view.dtype())?;
            let shape = Shape::new(view.shape().iter().map(|&d| d as i64).collect::<Vec<_>>());
            store.insert(name, LocalTensor::new(dtype, shape, view.data().to_vec())?);
        }
        Ok(store)
    }

    /// Write the whole store as a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::save_safetensors(path, self.tensors.iter().map(|(k, v)| (k.as_str(), v)))
    }
}

impl TensorStore for MemoryStore {
    fn info(&self, key: &str) -> Option<TensorInfo> {
        self.tensors.get(key).map(|t| TensorInfo {
            dtype: t.dtype(),
            shape: t.shape().clone(),
        })
    }

    fn read(&self, key: &str, dst: &mut [u8]) -> Result<()> {
        let t = self
            .tensors
            .get(key)
            .ok_or_else(|| MlbError::MissingKey(key.to_string()))?;
        check_len(key, t.as_bytes().len(), dst)?;
        dst.copy_from_slice(t.as_bytes());
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tensors.keys().cloned().collect();
        keys.sort();
        keys
    }
}

// ── Safetensors store ───────────────────────────────────────────────────

/// A memory-mapped safetensors file. Only the header is parsed up front;
/// tensor bytes are copied out of the mapping on [`read`](TensorStore::read).
pub struct SafeTensorStore {
    path: PathBuf,
    mmap: Mmap,
    index: HashMap<String, (TensorInfo, Range<usize>)>,
}

impl std::fmt::Debug for SafeTensorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeTensorStore")
            .field("path", &self.path)
            .field("tensors", &self.index.len())
            .finish()
    }
}

impl SafeTensorStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::open(&path)?;
        // SAFETY: The file must not be modified while the mmap is alive.
        // This is the standard usage pattern for read-only model weight files.
        let mmap = unsafe { Mmap::map(&file)? };

        let base = mmap.as_ptr() as usize;
        let mut index = HashMap::new();
        {
            let st = SafeTensors::deserialize(&mmap)
                .map_err(|e| MlbError::Store(format!("safetensors parse error: {e}")))?;
            for (name, view) in st.tensors() {
                let info = TensorInfo {
                    dtype: map_dtype(view.dtype())?,
                    shape: Shape::new(view.shape().iter().map(|&d| d as i64).collect::<Vec<_>>()),
                };
                let start = view.data().as_ptr() as usize - base;
                index.insert(name, (info, start..start + view.data().len()));
            }
        }
        debug!(path = %path.display(), tensors = index.len(), "opened safetensors store");
        Ok(Self { path, mmap, index })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl TensorStore for SafeTensorStore {
    fn info(&self, key: &str) -> Option<TensorInfo> {
        self.index.get(key).map(|(info, _)| info.clone())
    }

    fn read(&self, key: &str, dst: &mut [u8]) -> Result<()> {
        let (_, range) = self
            .index
            .get(key)
            .ok_or_else(|| MlbError::MissingKey(key.to_string()))?;
        let src = self
            .mmap
            .get(range.clone())
            .ok_or_else(|| MlbError::Store(format!("`{key}` lies outside the mapped file")))?;
        check_len(key, src.len(), dst)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.index.keys().cloned().collect();
        keys.sort();
        keys
    }
}
