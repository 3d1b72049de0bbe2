//! Batch rules and decompositions for vectorized execution.
//!
//! Each rule propagates batch-dimension metadata through one operator:
//! given every tensor argument as a (value, optional batch dim) pair, it
//! produces a result pair that is equivalent to running the unbatched
//! kernel independently on every slice along the batch axis.

use fv_core::{TensorOp, TensorValue, maybe_wrap_dim};
use fv_kernels as kernels;
use smallvec::{SmallVec, smallvec};

use crate::{BatchDispatcher, BatchError, OpParams, kernel_err, tensor_err};

/// Scratch vector for dimension and size lists. Five inline slots cover
/// every realistic rank without touching the heap.
pub(crate) type VmapDimVec = SmallVec<[i64; 5]>;

// ── Batched value model ────────────────────────────────────────────

/// A tensor together with its optional batch dimension for one nesting
/// level.
///
/// When `bdim` is `Some(i)`, axis `i` of `value` is the hidden batch axis
/// and removing it recovers the logical shape the caller sees. When `bdim`
/// is `None`, the value is not batched at this level and participates as a
/// broadcast operand. A `BatchedValue` lives for exactly one dispatch
/// step; it is never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchedValue {
    pub value: TensorValue,
    pub bdim: Option<usize>,
}

impl BatchedValue {
    #[must_use]
    pub fn batched(value: TensorValue, bdim: usize) -> Self {
        Self {
            value,
            bdim: Some(bdim),
        }
    }

    #[must_use]
    pub fn unbatched(value: TensorValue) -> Self {
        Self { value, bdim: None }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.value.rank()
    }

    /// Rank as the caller sees it, excluding the batch axis.
    #[must_use]
    pub fn logical_rank(&self) -> usize {
        rank_without_batch_dim(&self.value, self.bdim)
    }

    /// Shape as the caller sees it, excluding the batch axis.
    #[must_use]
    pub fn logical_sizes(&self) -> Vec<u32> {
        let mut sizes = self.value.shape.dims.clone();
        if let Some(bdim) = self.bdim
            && bdim < sizes.len()
        {
            sizes.remove(bdim);
        }
        sizes
    }

    #[must_use]
    pub fn batch_size(&self) -> Option<u32> {
        self.bdim
            .and_then(|bdim| self.value.shape.dims.get(bdim).copied())
    }
}

// ── Dimension utilities ────────────────────────────────────────────

/// Move the batch axis to position 0, preserving the order of the other
/// axes. An absent batch dim is a no-op, as is a batch dim already at
/// the front.
pub fn move_batch_dim_to_front(
    value: &TensorValue,
    bdim: Option<usize>,
) -> Result<TensorValue, BatchError> {
    let Some(bdim) = bdim else {
        return Ok(value.clone());
    };
    let rank = value.rank();
    if bdim >= rank {
        return Err(BatchError::BatchDimOutOfBounds { bdim, rank });
    }
    if bdim == 0 {
        return Ok(value.clone());
    }
    kernels::movedim(value, bdim as i64, 0).map_err(kernel_err)
}

/// The rank the caller believes the tensor has.
#[must_use]
pub fn rank_without_batch_dim(value: &TensorValue, bdim: Option<usize>) -> usize {
    match bdim {
        Some(_) => value.rank() - 1,
        None => value.rank(),
    }
}

/// Translate a caller-visible dimension index into the physical axis of a
/// tensor whose batch axis has been canonicalized to position 0.
pub fn get_physical_dim(
    value: &TensorValue,
    has_batch_dim: bool,
    logical_dim: i64,
) -> Result<usize, BatchError> {
    let logical_rank = if has_batch_dim {
        value.rank().saturating_sub(1)
    } else {
        value.rank()
    };
    let wrapped = maybe_wrap_dim(logical_dim, logical_rank)?;
    Ok(if has_batch_dim { wrapped + 1 } else { wrapped })
}

// ── Batch rules ────────────────────────────────────────────────────

fn single_batched<'a>(
    op: TensorOp,
    inputs: &'a [BatchedValue],
) -> Result<&'a BatchedValue, BatchError> {
    if inputs.len() != 1 {
        return Err(BatchError::ArityMismatch {
            op,
            expected: 1,
            actual: inputs.len(),
        });
    }
    Ok(&inputs[0])
}

pub fn unsqueeze_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Unsqueeze, inputs)?;
    let dim = parse_i64(TensorOp::Unsqueeze, "dim", params)?;
    if input.bdim.is_none() {
        let result = kernels::unsqueeze(&input.value, dim).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let rank = rank_without_batch_dim(&input.value, input.bdim);
    let dim = maybe_wrap_dim(dim, rank + 1)? as i64 + 1;
    let result = kernels::unsqueeze(&moved, dim).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn repeat_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Repeat, inputs)?;
    let sizes = parse_i64_list(TensorOp::Repeat, "sizes", params)?;
    if input.bdim.is_none() {
        let result = kernels::repeat(&input.value, &sizes).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }

    let mut sizes_with_bdim: VmapDimVec = smallvec![1];
    sizes_with_bdim.extend_from_slice(&sizes);

    let mut moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    while moved.rank() < sizes_with_bdim.len() {
        moved = kernels::unsqueeze(&moved, 1).map_err(kernel_err)?;
    }
    let result = kernels::repeat(&moved, &sizes_with_bdim).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn diag_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Diag, inputs)?;
    let offset = parse_opt_i64(TensorOp::Diag, "offset", params, 0)?;
    if input.bdim.is_none() {
        let result = kernels::diag(&input.value, offset).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let rank = rank_without_batch_dim(&input.value, input.bdim);

    match rank {
        1 => {
            let result = kernels::diag_embed(&moved, offset).map_err(kernel_err)?;
            Ok(BatchedValue::batched(result, 0))
        }
        2 => {
            // The diagonal axis lands last, so the batch axis is pushed to
            // the back first and re-emerges second-to-last.
            let shifted = kernels::movedim(&moved, 0, -1).map_err(kernel_err)?;
            let result = kernels::diagonal(&shifted, offset, 0, 1).map_err(kernel_err)?;
            Ok(BatchedValue::batched(result, rank - 2))
        }
        rank => Err(BatchError::InvalidDiagRank { rank }),
    }
}

pub fn unsafe_view_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::UnsafeView, inputs)?;
    let size = parse_i64_list(TensorOp::UnsafeView, "size", params)?;
    let Some(bdim) = input.bdim else {
        panic!("_unsafe_view batch rule invoked without a batch dimension");
    };

    let mut view_size: VmapDimVec = size.into_iter().collect();
    view_size.insert(bdim, i64::from(input.value.shape.dims[bdim]));

    let result = kernels::unsafe_view(&input.value, &view_size).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, bdim))
}

pub fn flip_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Flip, inputs)?;
    let dims = parse_i64_list(TensorOp::Flip, "dims", params)?;
    if input.bdim.is_none() {
        let result = kernels::flip(&input.value, &dims).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let physical = dims
        .iter()
        .map(|&d| get_physical_dim(&input.value, true, d).map(|p| p as i64))
        .collect::<Result<VmapDimVec, BatchError>>()?;
    let result = kernels::flip(&moved, &physical).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn diagonal_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Diagonal, inputs)?;
    let offset = parse_opt_i64(TensorOp::Diagonal, "offset", params, 0)?;
    let dim1 = parse_opt_i64(TensorOp::Diagonal, "dim1", params, 0)?;
    let dim2 = parse_opt_i64(TensorOp::Diagonal, "dim2", params, 1)?;
    if input.bdim.is_none() {
        let result =
            kernels::diagonal(&input.value, offset, dim1, dim2).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let dim1 = get_physical_dim(&input.value, true, dim1)? as i64;
    let dim2 = get_physical_dim(&input.value, true, dim2)? as i64;
    // diagonal removes dim1/dim2 and appends the diagonal axis last, so
    // the front batch axis keeps position 0.
    let result = kernels::diagonal(&moved, offset, dim1, dim2).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn sum_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Sum, inputs)?;
    let logical_dims = if params.contains_key("dims") {
        Some(parse_i64_list(TensorOp::Sum, "dims", params)?)
    } else {
        None
    };
    if input.bdim.is_none() {
        let result =
            kernels::sum(&input.value, logical_dims.as_deref()).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let physical = match logical_dims {
        None => (1..moved.rank()).map(|a| a as i64).collect::<VmapDimVec>(),
        Some(list) => list
            .iter()
            .map(|&d| get_physical_dim(&input.value, true, d).map(|p| p as i64))
            .collect::<Result<VmapDimVec, BatchError>>()?,
    };
    if physical.is_empty() {
        // logical rank 0: nothing to reduce per slice
        return Ok(BatchedValue::batched(moved, 0));
    }
    let result = kernels::sum(&moved, Some(physical.as_slice())).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn broadcast_to_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::BroadcastTo, inputs)?;
    let size = parse_i64_list(TensorOp::BroadcastTo, "size", params)?;
    if input.bdim.is_none() {
        let result = kernels::broadcast_to(&input.value, &size).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let mut moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let batch_size = i64::from(moved.shape.dims[0]);

    // Pad the logical rank up to the target rank right behind the batch
    // axis, so the right-aligned broadcast lines the batch axes up.
    let logical_rank = moved.rank() - 1;
    if size.len() >= logical_rank {
        for _ in 0..(size.len() - logical_rank) {
            moved = kernels::unsqueeze(&moved, 1).map_err(kernel_err)?;
        }
    }

    let mut padded_size: VmapDimVec = smallvec![batch_size];
    padded_size.extend_from_slice(&size);
    let result = kernels::broadcast_to(&moved, &padded_size).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn slice_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Slice, inputs)?;
    let dim = parse_i64(TensorOp::Slice, "dim", params)?;
    let start = parse_i64(TensorOp::Slice, "start", params)?;
    let end = parse_i64(TensorOp::Slice, "end", params)?;
    if input.bdim.is_none() {
        let result = kernels::slice(&input.value, dim, start, end).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let dim = get_physical_dim(&input.value, true, dim)? as i64;
    let result = kernels::slice(&moved, dim, start, end).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

/// The move-to-front-and-call family: operators whose axes are relative to
/// the trailing dimensions, so a leading batch axis needs no argument
/// translation at all.
fn variadic_bdims_batch_rule(
    op: TensorOp,
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(op, inputs)?;
    if input.bdim.is_none() {
        let value = std::slice::from_ref(&input.value);
        let result = kernels::eval_op(op, value, params).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    }
    let moved = move_batch_dim_to_front(&input.value, input.bdim)?;
    let result = kernels::eval_op(op, &[moved], params).map_err(kernel_err)?;
    Ok(BatchedValue::batched(result, 0))
}

pub fn tril_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    variadic_bdims_batch_rule(TensorOp::Tril, inputs, params)
}

pub fn triu_batch_rule(
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    variadic_bdims_batch_rule(TensorOp::Triu, inputs, params)
}

// ── Decompositions ─────────────────────────────────────────────────
//
// Expressed purely through the dispatcher over operators that already
// have batch rules; correctness is compositional, so there is no batch
// dim arithmetic here.

pub fn trace_decomposition(
    dispatcher: &BatchDispatcher<'_>,
    inputs: &[BatchedValue],
    _params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Trace, inputs)?;
    let diag = dispatcher.call(
        TensorOp::Diagonal,
        std::slice::from_ref(input),
        &OpParams::new(),
    )?;
    dispatcher.call(TensorOp::Sum, std::slice::from_ref(&diag), &OpParams::new())
}

pub fn expand_as_decomposition(
    dispatcher: &BatchDispatcher<'_>,
    inputs: &[BatchedValue],
    _params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    if inputs.len() != 2 {
        return Err(BatchError::ArityMismatch {
            op: TensorOp::ExpandAs,
            expected: 2,
            actual: inputs.len(),
        });
    }
    let target = inputs[1].logical_sizes();
    let mut params = OpParams::new();
    params.insert(
        "size".to_owned(),
        format_csv(&target.iter().map(|&d| i64::from(d)).collect::<Vec<_>>()),
    );
    dispatcher.call(
        TensorOp::BroadcastTo,
        std::slice::from_ref(&inputs[0]),
        &params,
    )
}

pub fn narrow_decomposition(
    dispatcher: &BatchDispatcher<'_>,
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Narrow, inputs)?;
    let dim = parse_i64(TensorOp::Narrow, "dim", params)?;
    let start = parse_i64(TensorOp::Narrow, "start", params)?;
    let length = parse_i64(TensorOp::Narrow, "length", params)?;
    if length < 0 {
        return Err(BatchError::Param {
            op: TensorOp::Narrow,
            key: "length",
            detail: format!("length must be non-negative, got {length}"),
        });
    }

    let sizes = input.logical_sizes();
    let wrapped = maybe_wrap_dim(dim, sizes.len())?;
    let dim_size = i64::from(sizes[wrapped]);
    let start = if start < 0 { start + dim_size } else { start };
    if start < 0 || start + length > dim_size {
        return Err(BatchError::Param {
            op: TensorOp::Narrow,
            key: "start",
            detail: format!(
                "range [{start}, {}) is invalid for axis {wrapped} of size {dim_size}",
                start + length
            ),
        });
    }

    let mut slice_params = OpParams::new();
    slice_params.insert("dim".to_owned(), wrapped.to_string());
    slice_params.insert("start".to_owned(), start.to_string());
    slice_params.insert("end".to_owned(), (start + length).to_string());
    dispatcher.call(TensorOp::Slice, std::slice::from_ref(input), &slice_params)
}

pub fn flatten_decomposition(
    dispatcher: &BatchDispatcher<'_>,
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let input = single_batched(TensorOp::Flatten, inputs)?;
    let start_dim = parse_opt_i64(TensorOp::Flatten, "start_dim", params, 0)?;
    let end_dim = parse_opt_i64(TensorOp::Flatten, "end_dim", params, -1)?;

    let sizes = input.logical_sizes();
    let view_sizes: Vec<i64> = if sizes.is_empty() {
        vec![1]
    } else {
        let start = maybe_wrap_dim(start_dim, sizes.len())?;
        let end = maybe_wrap_dim(end_dim, sizes.len())?;
        if start > end {
            return Err(BatchError::Param {
                op: TensorOp::Flatten,
                key: "start_dim",
                detail: format!("start_dim {start} must not come after end_dim {end}"),
            });
        }
        let collapsed: i64 = sizes[start..=end].iter().map(|&d| i64::from(d)).product();
        sizes[..start]
            .iter()
            .map(|&d| i64::from(d))
            .chain(std::iter::once(collapsed))
            .chain(sizes[end + 1..].iter().map(|&d| i64::from(d)))
            .collect()
    };

    let mut view_params = OpParams::new();
    view_params.insert("size".to_owned(), format_csv(&view_sizes));
    dispatcher.call(
        TensorOp::UnsafeView,
        std::slice::from_ref(input),
        &view_params,
    )
}

// ── Generic fallback ───────────────────────────────────────────────

/// Loop-and-stack fallback for operators without a hand-written rule:
/// slice every batched input per batch index, run the unbatched kernel,
/// and stack the results along a new leading axis.
pub(crate) fn loop_and_stack(
    op: TensorOp,
    inputs: &[BatchedValue],
    params: &OpParams,
) -> Result<BatchedValue, BatchError> {
    let mut batch_size: Option<usize> = None;
    for input in inputs {
        let Some(bdim) = input.bdim else { continue };
        if bdim >= input.value.rank() {
            return Err(BatchError::BatchDimOutOfBounds {
                bdim,
                rank: input.value.rank(),
            });
        }
        let size = input.value.shape.dims[bdim] as usize;
        match batch_size {
            None => batch_size = Some(size),
            Some(expected) if expected != size => {
                return Err(BatchError::MismatchedBatchSizes {
                    expected,
                    actual: size,
                });
            }
            Some(_) => {}
        }
    }

    let Some(batch_size) = batch_size else {
        let values: Vec<TensorValue> = inputs.iter().map(|input| input.value.clone()).collect();
        let result = kernels::eval_op(op, &values, params).map_err(kernel_err)?;
        return Ok(BatchedValue::unbatched(result));
    };

    let moved: Vec<(TensorValue, bool)> = inputs
        .iter()
        .map(|input| match input.bdim {
            Some(_) => move_batch_dim_to_front(&input.value, input.bdim).map(|t| (t, true)),
            None => Ok((input.value.clone(), false)),
        })
        .collect::<Result<_, _>>()?;

    let mut per_index = Vec::with_capacity(batch_size);
    for index in 0..batch_size {
        let slices: Vec<TensorValue> = moved
            .iter()
            .map(|(value, is_batched)| {
                if *is_batched {
                    value.slice_axis0(index).map_err(tensor_err)
                } else {
                    Ok(value.clone())
                }
            })
            .collect::<Result<_, _>>()?;
        per_index.push(kernels::eval_op(op, &slices, params).map_err(kernel_err)?);
    }

    let stacked = TensorValue::stack_axis0(&per_index).map_err(tensor_err)?;
    Ok(BatchedValue::batched(stacked, 0))
}

// ── Parameter helpers ──────────────────────────────────────────────

pub(crate) fn parse_i64(
    op: TensorOp,
    key: &'static str,
    params: &OpParams,
) -> Result<i64, BatchError> {
    let raw = params.get(key).ok_or(BatchError::Param {
        op,
        key,
        detail: "missing required param".to_owned(),
    })?;
    raw.trim().parse::<i64>().map_err(|_| BatchError::Param {
        op,
        key,
        detail: format!("invalid integer '{raw}'"),
    })
}

pub(crate) fn parse_opt_i64(
    op: TensorOp,
    key: &'static str,
    params: &OpParams,
    default: i64,
) -> Result<i64, BatchError> {
    if params.contains_key(key) {
        parse_i64(op, key, params)
    } else {
        Ok(default)
    }
}

pub(crate) fn parse_i64_list(
    op: TensorOp,
    key: &'static str,
    params: &OpParams,
) -> Result<Vec<i64>, BatchError> {
    let raw = params.get(key).ok_or(BatchError::Param {
        op,
        key,
        detail: "missing required param".to_owned(),
    })?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|part| {
            part.trim().parse::<i64>().map_err(|_| BatchError::Param {
                op,
                key,
                detail: format!("invalid integer '{part}'"),
            })
        })
        .collect()
}

/// Format a list of values the way the kernel param parser reads them.
pub(crate) fn format_csv<T: std::fmt::Display>(vals: &[T]) -> String {
    vals.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
