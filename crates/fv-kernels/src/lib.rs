#![forbid(unsafe_code)]

//! Unbatched tensor math kernels.
//!
//! Every kernel operates on plain [`TensorValue`]s with ordinary arguments
//! (axis indices, size lists, scalars) and returns an owned dense result.
//! The batching layer treats this crate as a correctness oracle: a batch
//! rule is correct when its output, sliced per batch index, matches the
//! kernel applied to the corresponding input slice.

mod diagonal;
mod reduction;
mod tensor_ops;

use fv_core::{DimError, Shape, TensorOp, TensorValue, ValueError};
use std::collections::BTreeMap;

pub use diagonal::{diag, diag_embed, diagonal, tril, triu};
pub use reduction::{cumsum, sum};
pub use tensor_ops::{
    broadcast_to, flip, movedim, repeat, resize_, slice, unsafe_view, unsqueeze,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ArityMismatch {
        op: TensorOp,
        expected: usize,
        actual: usize,
    },
    MissingParam {
        op: TensorOp,
        key: &'static str,
    },
    InvalidParam {
        op: TensorOp,
        key: &'static str,
        detail: String,
    },
    ShapeMismatch {
        op: TensorOp,
        left: Shape,
        right: Shape,
    },
    TypeMismatch {
        op: TensorOp,
        detail: &'static str,
    },
    Unsupported {
        op: TensorOp,
        detail: String,
    },
    Dim(DimError),
    InvalidTensor(ValueError),
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                op,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "arity mismatch for {}: expected {}, got {}",
                    op.as_str(),
                    expected,
                    actual
                )
            }
            Self::MissingParam { op, key } => {
                write!(f, "missing required param '{}' for {}", key, op.as_str())
            }
            Self::InvalidParam { op, key, detail } => {
                write!(
                    f,
                    "invalid param '{}' for {}: {}",
                    key,
                    op.as_str(),
                    detail
                )
            }
            Self::ShapeMismatch { op, left, right } => {
                write!(
                    f,
                    "shape mismatch for {}: left={:?} right={:?}",
                    op.as_str(),
                    left.dims,
                    right.dims
                )
            }
            Self::TypeMismatch { op, detail } => {
                write!(f, "type mismatch for {}: {}", op.as_str(), detail)
            }
            Self::Unsupported { op, detail } => {
                write!(f, "unsupported {} behavior: {}", op.as_str(), detail)
            }
            Self::Dim(err) => write!(f, "{err}"),
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<DimError> for KernelError {
    fn from(value: DimError) -> Self {
        Self::Dim(value)
    }
}

impl From<ValueError> for KernelError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

// ── Parameter parsing ──────────────────────────────────────────────

pub(crate) fn require_param<'a>(
    op: TensorOp,
    key: &'static str,
    params: &'a BTreeMap<String, String>,
) -> Result<&'a str, KernelError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or(KernelError::MissingParam { op, key })
}

pub(crate) fn parse_i64_param(
    op: TensorOp,
    key: &'static str,
    params: &BTreeMap<String, String>,
) -> Result<i64, KernelError> {
    let raw = require_param(op, key, params)?;
    raw.trim()
        .parse::<i64>()
        .map_err(|_| KernelError::InvalidParam {
            op,
            key,
            detail: format!("invalid integer '{raw}'"),
        })
}

pub(crate) fn parse_opt_i64_param(
    op: TensorOp,
    key: &'static str,
    params: &BTreeMap<String, String>,
    default: i64,
) -> Result<i64, KernelError> {
    if params.contains_key(key) {
        parse_i64_param(op, key, params)
    } else {
        Ok(default)
    }
}

pub(crate) fn parse_i64_list_param(
    op: TensorOp,
    key: &'static str,
    params: &BTreeMap<String, String>,
) -> Result<Vec<i64>, KernelError> {
    let raw = require_param(op, key, params)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| KernelError::InvalidParam {
                    op,
                    key,
                    detail: format!("invalid integer '{part}'"),
                })
        })
        .collect()
}

fn single_input<'a>(
    op: TensorOp,
    inputs: &'a [TensorValue],
) -> Result<&'a TensorValue, KernelError> {
    if inputs.len() != 1 {
        return Err(KernelError::ArityMismatch {
            op,
            expected: 1,
            actual: inputs.len(),
        });
    }
    Ok(&inputs[0])
}

// ── Uniform kernel entry ───────────────────────────────────────────

/// Evaluate an operator on unbatched inputs. This is the single entry the
/// dispatch layer uses for the direct (no batch dim) path and for the
/// generic per-slice fallback.
pub fn eval_op(
    op: TensorOp,
    inputs: &[TensorValue],
    params: &BTreeMap<String, String>,
) -> Result<TensorValue, KernelError> {
    match op {
        TensorOp::Unsqueeze => {
            let t = single_input(op, inputs)?;
            unsqueeze(t, parse_i64_param(op, "dim", params)?)
        }
        TensorOp::Repeat => {
            let t = single_input(op, inputs)?;
            repeat(t, &parse_i64_list_param(op, "sizes", params)?)
        }
        TensorOp::Diag => {
            let t = single_input(op, inputs)?;
            diag(t, parse_opt_i64_param(op, "offset", params, 0)?)
        }
        TensorOp::Diagonal => {
            let t = single_input(op, inputs)?;
            diagonal(
                t,
                parse_opt_i64_param(op, "offset", params, 0)?,
                parse_opt_i64_param(op, "dim1", params, 0)?,
                parse_opt_i64_param(op, "dim2", params, 1)?,
            )
        }
        TensorOp::DiagEmbed => {
            let t = single_input(op, inputs)?;
            diag_embed(t, parse_opt_i64_param(op, "offset", params, 0)?)
        }
        TensorOp::UnsafeView => {
            let t = single_input(op, inputs)?;
            unsafe_view(t, &parse_i64_list_param(op, "size", params)?)
        }
        TensorOp::Flip => {
            let t = single_input(op, inputs)?;
            flip(t, &parse_i64_list_param(op, "dims", params)?)
        }
        TensorOp::Sum => {
            let t = single_input(op, inputs)?;
            if params.contains_key("dims") {
                sum(t, Some(&parse_i64_list_param(op, "dims", params)?))
            } else {
                sum(t, None)
            }
        }
        TensorOp::BroadcastTo => {
            let t = single_input(op, inputs)?;
            broadcast_to(t, &parse_i64_list_param(op, "size", params)?)
        }
        TensorOp::Slice => {
            let t = single_input(op, inputs)?;
            slice(
                t,
                parse_i64_param(op, "dim", params)?,
                parse_i64_param(op, "start", params)?,
                parse_i64_param(op, "end", params)?,
            )
        }
        TensorOp::Tril => {
            let t = single_input(op, inputs)?;
            tril(t, parse_opt_i64_param(op, "diagonal", params, 0)?)
        }
        TensorOp::Triu => {
            let t = single_input(op, inputs)?;
            triu(t, parse_opt_i64_param(op, "diagonal", params, 0)?)
        }
        TensorOp::Movedim => {
            let t = single_input(op, inputs)?;
            movedim(
                t,
                parse_i64_param(op, "source", params)?,
                parse_i64_param(op, "destination", params)?,
            )
        }
        TensorOp::Cumsum => {
            let t = single_input(op, inputs)?;
            cumsum(t, parse_i64_param(op, "dim", params)?)
        }
        TensorOp::Trace | TensorOp::ExpandAs | TensorOp::Narrow | TensorOp::Flatten => {
            Err(KernelError::Unsupported {
                op,
                detail: "operator is provided as a decomposition, not a kernel".to_owned(),
            })
        }
        TensorOp::Resize => Err(KernelError::Unsupported {
            op,
            detail: "resize_ mutates in place; call kernels::resize_ directly".to_owned(),
        }),
    }
}

// ── Shared index arithmetic ────────────────────────────────────────

/// Row-major strides for a dense tensor with the given dims.
pub(crate) fn contiguous_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as usize;
    }
    strides
}

pub(crate) fn checked_element_count(op: TensorOp, shape: &Shape) -> Result<usize, KernelError> {
    let count = shape.element_count().ok_or_else(|| {
        KernelError::InvalidTensor(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })
    })?;
    usize::try_from(count).map_err(|_| KernelError::Unsupported {
        op,
        detail: format!("element count {count} exceeds addressable size"),
    })
}
