//! Core type definitions: DType, Shape.

/// Largest byte size of any tensor or arena.
pub const MAX_BYTES: usize = isize::MAX as usize;

/// Supported element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    BF16,
    I32,
    I64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Floating point types can be converted into each other on load.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
        }
    }
}

impl std::str::FromStr for DType {
    type Err = crate::MlbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            other => Err(crate::MlbError::InvalidArgument(format!(
                "unknown dtype `{other}`"
            ))),
        }
    }
}

/// Tensor shape (dimensions, outermost first).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    /// Scalar (rank-0) shape.
    pub fn scalar() -> Self {
        Self(vec![])
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements, saturating at `i64::MAX`.
    pub fn numel(&self) -> i64 {
        self.checked_numel().unwrap_or(i64::MAX)
    }

    /// Total number of elements, or `None` when the product overflows.
    pub fn checked_numel(&self) -> Option<i64> {
        self.0.iter().try_fold(1i64, |n, &d| n.checked_mul(d))
    }

    /// Bytes needed for `dtype` elements of this shape. `None` for negative
    /// dimensions or when the size exceeds [`MAX_BYTES`].
    pub fn byte_len(&self, dtype: DType) -> Option<usize> {
        let n = usize::try_from(self.checked_numel()?).ok()?;
        n.checked_mul(dtype.size_bytes()).filter(|&b| b <= MAX_BYTES)
    }

    /// Get dimension at axis (supports negative indexing).
    pub fn dim(&self, axis: i32) -> Option<i64> {
        let ndim = self.0.len() as i32;
        let idx = if axis < 0 { ndim + axis } else { axis };
        if idx >= 0 && idx < ndim {
            Some(self.0[idx as usize])
        } else {
            None
        }
    }

    /// Dimensions with leading size-1 axes stripped.
    pub fn squeezed(&self) -> &[i64] {
        let lead = self.0.iter().take_while(|&&d| d == 1).count();
        let lead = lead.min(self.0.len().saturating_sub(1));
        &self.0[lead..]
    }

    /// Same layout once leading size-1 axes are ignored (`[1, 4]` ~ `[4]`).
    pub fn same_layout(&self, other: &Shape) -> bool {
        self.squeezed() == other.squeezed()
    }

    /// Compute the broadcast shape of two shapes, or None if incompatible.
    pub fn broadcast_shapes(a: &Shape, b: &Shape) -> Option<Shape> {
        let a_dims = &a.0;
        let b_dims = &b.0;
        let max_ndim = a_dims.len().max(b_dims.len());

        let mut result = Vec::with_capacity(max_ndim);

        for i in 0..max_ndim {
            let da = if i < a_dims.len() {
                a_dims[a_dims.len() - 1 - i]
            } else {
                1
            };
            let db = if i < b_dims.len() {
                b_dims[b_dims.len() - 1 - i]
            } else {
                1
            };

            if da == db {
                result.push(da);
            } else if da == 1 {
                result.push(db);
            } else if db == 1 {
                result.push(da);
            } else {
                return None;
            }
        }

        result.reverse();
        Some(Shape::new(result))
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<Vec<i64>> for Shape {
    fn from(dims: Vec<i64>) -> Self {
        Shape(dims)
    }
}

impl<const N: usize> From<[i64; N]> for Shape {
    fn from(dims: [i64; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
