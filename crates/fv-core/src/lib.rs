#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F64,
    I64,
    Bool,
}

/// A single tensor element with a bit-exact float encoding, so tensor
/// values stay `Eq` and hash/digest friendly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    F64Bits(u64),
    I64(i64),
    Bool(bool),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        match dtype {
            DType::F64 => Self::from_f64(0.0),
            DType::I64 => Self::I64(0),
            DType::Bool => Self::Bool(false),
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::F64Bits(_) => DType::F64,
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        match self {
            Self::F64Bits(bits) => Some(f64::from_bits(bits)),
            Self::I64(value) => Some(value as f64),
            Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::F64Bits(_) | Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            Self::F64Bits(_) | Self::I64(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

// ── Tensor values ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;

        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }

        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self {
            dtype: DType::F64,
            shape: Shape::scalar(),
            elements: vec![Literal::from_f64(value)],
        }
    }

    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self {
            dtype: DType::I64,
            shape: Shape::scalar(),
            elements: vec![Literal::I64(value)],
        }
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::from_f64s(&[values.len() as u32], values)
    }

    pub fn from_f64s(dims: &[u32], values: &[f64]) -> Result<Self, ValueError> {
        let elements = values
            .iter()
            .copied()
            .map(Literal::from_f64)
            .collect::<Vec<_>>();
        Self::new(DType::F64, Shape { dims: dims.to_vec() }, elements)
    }

    pub fn from_i64s(dims: &[u32], values: &[i64]) -> Result<Self, ValueError> {
        let elements = values.iter().copied().map(Literal::I64).collect::<Vec<_>>();
        Self::new(DType::I64, Shape { dims: dims.to_vec() }, elements)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn leading_dim(&self) -> Option<u32> {
        self.shape.dims.first().copied()
    }

    /// Extract the `index`-th slice along axis 0. A rank-1 input yields a
    /// rank-0 tensor.
    pub fn slice_axis0(&self, index: usize) -> Result<Self, ValueError> {
        let axis_size = self
            .leading_dim()
            .ok_or(ValueError::RankZeroAxisSliceUnsupported)?;
        if index >= axis_size as usize {
            return Err(ValueError::SliceIndexOutOfBounds {
                index,
                axis_size: axis_size as usize,
            });
        }

        let slice_len = self
            .shape
            .dims
            .iter()
            .skip(1)
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim as usize))
            .ok_or(ValueError::ShapeOverflow {
                shape: self.shape.clone(),
            })?;

        let start = index * slice_len;
        let elements = self.elements[start..start + slice_len].to_vec();
        let subshape = Shape {
            dims: self.shape.dims[1..].to_vec(),
        };
        Self::new(self.dtype, subshape, elements)
    }

    /// Stack equally shaped tensors along a new leading axis.
    pub fn stack_axis0(slices: &[Self]) -> Result<Self, ValueError> {
        let first = slices.first().ok_or(ValueError::EmptyAxisStack)?;

        let mut elements = Vec::with_capacity(first.elements.len() * slices.len());
        elements.extend_from_slice(&first.elements);
        for tensor in &slices[1..] {
            if tensor.dtype != first.dtype {
                return Err(ValueError::AxisStackDTypeMismatch {
                    expected: first.dtype,
                    actual: tensor.dtype,
                });
            }
            if tensor.shape != first.shape {
                return Err(ValueError::AxisStackShapeMismatch {
                    expected: first.shape.clone(),
                    actual: tensor.shape.clone(),
                });
            }
            elements.extend_from_slice(&tensor.elements);
        }

        let mut dims = Vec::with_capacity(first.shape.rank() + 1);
        dims.push(slices.len() as u32);
        dims.extend_from_slice(&first.shape.dims);
        Self::new(first.dtype, Shape { dims }, elements)
    }

    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.elements.iter().copied().map(Literal::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        self.elements.iter().copied().map(Literal::as_i64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    RankZeroAxisSliceUnsupported,
    SliceIndexOutOfBounds {
        index: usize,
        axis_size: usize,
    },
    EmptyAxisStack,
    AxisStackShapeMismatch {
        expected: Shape,
        actual: Shape,
    },
    AxisStackDTypeMismatch {
        expected: DType,
        actual: DType,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {:?}", shape.dims)
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => {
                write!(
                    f,
                    "tensor element count mismatch for shape {:?}: expected {}, got {}",
                    shape.dims, expected_count, actual_count
                )
            }
            Self::RankZeroAxisSliceUnsupported => {
                write!(f, "cannot axis-slice rank-0 scalar tensor")
            }
            Self::SliceIndexOutOfBounds { index, axis_size } => {
                write!(
                    f,
                    "axis-slice index {} out of bounds for axis size {}",
                    index, axis_size
                )
            }
            Self::EmptyAxisStack => {
                write!(f, "cannot stack empty slice list")
            }
            Self::AxisStackShapeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack shape mismatch: expected {:?}, got {:?}",
                    expected.dims, actual.dims
                )
            }
            Self::AxisStackDTypeMismatch { expected, actual } => {
                write!(
                    f,
                    "stack dtype mismatch: expected {:?}, got {:?}",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for ValueError {}

// ── Operator identities ────────────────────────────────────────────

/// Identity of a tensor operator as seen by the dispatch registry.
/// Lookup is by exact identity; there is no partial matching between
/// operator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TensorOp {
    Unsqueeze,
    Repeat,
    Diag,
    Diagonal,
    DiagEmbed,
    UnsafeView,
    Flip,
    Sum,
    BroadcastTo,
    Slice,
    Tril,
    Triu,
    Movedim,
    Cumsum,
    Trace,
    ExpandAs,
    Narrow,
    Flatten,
    Resize,
}

impl TensorOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsqueeze => "unsqueeze",
            Self::Repeat => "repeat",
            Self::Diag => "diag",
            Self::Diagonal => "diagonal",
            Self::DiagEmbed => "diag_embed",
            Self::UnsafeView => "_unsafe_view",
            Self::Flip => "flip",
            Self::Sum => "sum",
            Self::BroadcastTo => "broadcast_to",
            Self::Slice => "slice",
            Self::Tril => "tril",
            Self::Triu => "triu",
            Self::Movedim => "movedim",
            Self::Cumsum => "cumsum",
            Self::Trace => "trace",
            Self::ExpandAs => "expand_as",
            Self::Narrow => "narrow",
            Self::Flatten => "flatten",
            Self::Resize => "resize_",
        }
    }
}

/// Memory-layout format argument accepted by mutating operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryFormat {
    Contiguous,
    ChannelsLast,
}

impl MemoryFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contiguous => "contiguous",
            Self::ChannelsLast => "channels_last",
        }
    }
}

// ── Dimension normalization ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimError {
    OutOfRange { dim: i64, rank: usize },
}

impl std::fmt::Display for DimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange { dim, rank } => {
                write!(
                    f,
                    "dimension {} out of range for rank {} (valid range [{}, {}])",
                    dim,
                    rank,
                    -(*rank as i64),
                    rank.saturating_sub(1)
                )
            }
        }
    }
}

impl std::error::Error for DimError {}

/// Resolve a possibly-negative dimension index against `rank`.
/// Rank-0 tensors accept 0 and -1, following the scalar-as-1-d convention.
pub fn maybe_wrap_dim(dim: i64, rank: usize) -> Result<usize, DimError> {
    if rank == 0 {
        return if dim == 0 || dim == -1 {
            Ok(0)
        } else {
            Err(DimError::OutOfRange { dim, rank })
        };
    }
    let rank_i = rank as i64;
    if (0..rank_i).contains(&dim) {
        Ok(dim as usize)
    } else if (-rank_i..0).contains(&dim) {
        Ok((dim + rank_i) as usize)
    } else {
        Err(DimError::OutOfRange { dim, rank })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_rejects_element_count_mismatch() {
        let err = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ValueError::ElementCountMismatch { .. }));
    }

    #[test]
    fn slice_then_stack_round_trips() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let rows = (0..2)
            .map(|i| t.slice_axis0(i).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(rows[1].to_f64_vec().unwrap(), vec![4.0, 5.0, 6.0]);
        let restacked = TensorValue::stack_axis0(&rows).unwrap();
        assert_eq!(restacked, t);
    }

    #[test]
    fn rank_one_slice_is_rank_zero() {
        let t = TensorValue::vector_f64(&[7.0, 8.0]).unwrap();
        let s = t.slice_axis0(1).unwrap();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.to_f64_vec().unwrap(), vec![8.0]);
    }

    #[test]
    fn stack_rejects_mismatched_shapes() {
        let a = TensorValue::vector_f64(&[1.0]).unwrap();
        let b = TensorValue::vector_f64(&[1.0, 2.0]).unwrap();
        let err = TensorValue::stack_axis0(&[a, b]).unwrap_err();
        assert!(matches!(err, ValueError::AxisStackShapeMismatch { .. }));
    }

    #[test]
    fn wrap_dim_resolves_negative_indices() {
        assert_eq!(maybe_wrap_dim(-1, 3).unwrap(), 2);
        assert_eq!(maybe_wrap_dim(0, 3).unwrap(), 0);
        assert_eq!(maybe_wrap_dim(2, 3).unwrap(), 2);
    }

    #[test]
    fn wrap_dim_rejects_out_of_range() {
        assert!(maybe_wrap_dim(3, 3).is_err());
        assert!(maybe_wrap_dim(-4, 3).is_err());
    }

    #[test]
    fn wrap_dim_scalar_convention() {
        assert_eq!(maybe_wrap_dim(0, 0).unwrap(), 0);
        assert_eq!(maybe_wrap_dim(-1, 0).unwrap(), 0);
        assert!(maybe_wrap_dim(1, 0).is_err());
    }

    #[test]
    fn tensor_value_serde_round_trip() {
        let t = TensorValue::from_f64s(&[2, 2], &[1.0, -2.5, 0.0, 4.0]).unwrap();
        let encoded = serde_json::to_string(&t).expect("serialize should work");
        let decoded: TensorValue = serde_json::from_str(&encoded).expect("deserialize should work");
        assert_eq!(decoded, t);
    }
}
