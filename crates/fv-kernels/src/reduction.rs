//! Reduction kernels: axis-wise summation and inclusive prefix sums.

use fv_core::{DType, Literal, Shape, TensorOp, TensorValue, maybe_wrap_dim};

use crate::{KernelError, checked_element_count, contiguous_strides};

/// Sum over the listed axes; all axes when `dims` is `None`. Summed axes
/// are removed from the result shape (a full reduction yields rank 0).
pub fn sum(t: &TensorValue, dims: Option<&[i64]>) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    let mut reduce_axis = vec![false; rank];
    match dims {
        None => reduce_axis.iter_mut().for_each(|r| *r = true),
        Some(list) => {
            for &d in list {
                let wrapped = maybe_wrap_dim(d, rank)?;
                if reduce_axis[wrapped] {
                    return Err(KernelError::InvalidParam {
                        op: TensorOp::Sum,
                        key: "dims",
                        detail: format!("axis {wrapped} listed more than once"),
                    });
                }
                reduce_axis[wrapped] = true;
            }
        }
    }
    if !reduce_axis.contains(&true) {
        return Ok(t.clone());
    }

    let kept_axes: Vec<usize> = (0..rank).filter(|&a| !reduce_axis[a]).collect();
    let out_dims: Vec<u32> = kept_axes.iter().map(|&a| t.shape.dims[a]).collect();
    let out_shape = Shape { dims: out_dims };
    let out_count = checked_element_count(TensorOp::Sum, &out_shape)?;

    let in_strides = contiguous_strides(&t.shape.dims);
    let out_strides = contiguous_strides(&out_shape.dims);

    match t.dtype {
        DType::F64 => {
            let mut accum = vec![0.0_f64; out_count];
            accumulate(t, &kept_axes, &in_strides, &out_strides, &mut accum, |lit| {
                lit.as_f64()
            })?;
            let elements = accum.into_iter().map(Literal::from_f64).collect();
            Ok(TensorValue::new(t.dtype, out_shape, elements)?)
        }
        DType::I64 => {
            let mut accum = vec![0_i64; out_count];
            accumulate(t, &kept_axes, &in_strides, &out_strides, &mut accum, |lit| {
                lit.as_i64()
            })?;
            let elements = accum.into_iter().map(Literal::I64).collect();
            Ok(TensorValue::new(t.dtype, out_shape, elements)?)
        }
        DType::Bool => Err(KernelError::TypeMismatch {
            op: TensorOp::Sum,
            detail: "sum is not defined for bool tensors",
        }),
    }
}

fn accumulate<T: std::ops::AddAssign + Copy>(
    t: &TensorValue,
    kept_axes: &[usize],
    in_strides: &[usize],
    out_strides: &[usize],
    accum: &mut [T],
    extract: impl Fn(Literal) -> Option<T>,
) -> Result<(), KernelError> {
    for (flat, &lit) in t.elements.iter().enumerate() {
        let mut out_flat = 0_usize;
        for (out_axis, &in_axis) in kept_axes.iter().enumerate() {
            let coord = (flat / in_strides[in_axis]) % t.shape.dims[in_axis] as usize;
            out_flat += coord * out_strides[out_axis];
        }
        let value = extract(lit).ok_or(KernelError::TypeMismatch {
            op: TensorOp::Sum,
            detail: "element does not match the tensor dtype",
        })?;
        accum[out_flat] += value;
    }
    Ok(())
}

/// Inclusive prefix sum along one axis. Rank-0 input is returned as is.
pub fn cumsum(t: &TensorValue, dim: i64) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    let d = maybe_wrap_dim(dim, rank)?;
    if rank == 0 {
        return Ok(t.clone());
    }

    let strides = contiguous_strides(&t.shape.dims);
    let dim_size = t.shape.dims[d] as usize;

    match t.dtype {
        DType::F64 => {
            let mut values = t
                .to_f64_vec()
                .ok_or(KernelError::TypeMismatch {
                    op: TensorOp::Cumsum,
                    detail: "element does not match the tensor dtype",
                })?;
            prefix_sum(&mut values, strides[d], dim_size);
            let elements = values.into_iter().map(Literal::from_f64).collect();
            Ok(TensorValue::new(t.dtype, t.shape.clone(), elements)?)
        }
        DType::I64 => {
            let mut values = t
                .to_i64_vec()
                .ok_or(KernelError::TypeMismatch {
                    op: TensorOp::Cumsum,
                    detail: "element does not match the tensor dtype",
                })?;
            prefix_sum(&mut values, strides[d], dim_size);
            let elements = values.into_iter().map(Literal::I64).collect();
            Ok(TensorValue::new(t.dtype, t.shape.clone(), elements)?)
        }
        DType::Bool => Err(KernelError::TypeMismatch {
            op: TensorOp::Cumsum,
            detail: "cumsum is not defined for bool tensors",
        }),
    }
}

fn prefix_sum<T: std::ops::AddAssign + Copy>(values: &mut [T], stride: usize, dim_size: usize) {
    for flat in 0..values.len() {
        let coord = (flat / stride) % dim_size;
        if coord > 0 {
            let prev = values[flat - stride];
            values[flat] += prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_all_axes_yields_rank_zero() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let s = sum(&t, None).unwrap();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.to_f64_vec().unwrap(), vec![21.0]);
    }

    #[test]
    fn sum_along_one_axis_removes_it() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let rows = sum(&t, Some(&[1])).unwrap();
        assert_eq!(rows.shape.dims, vec![2]);
        assert_eq!(rows.to_f64_vec().unwrap(), vec![6.0, 15.0]);
        let cols = sum(&t, Some(&[-2])).unwrap();
        assert_eq!(cols.to_f64_vec().unwrap(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn sum_with_no_axes_is_identity() {
        let t = TensorValue::from_i64s(&[2], &[3, 4]).unwrap();
        assert_eq!(sum(&t, Some(&[])).unwrap(), t);
    }

    #[test]
    fn sum_rejects_duplicate_axes() {
        let t = TensorValue::from_f64s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(sum(&t, Some(&[1, -1])).is_err());
    }

    #[test]
    fn cumsum_accumulates_along_axis() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let along_cols = cumsum(&t, 1).unwrap();
        assert_eq!(
            along_cols.to_f64_vec().unwrap(),
            vec![1.0, 3.0, 6.0, 4.0, 9.0, 15.0]
        );
        let along_rows = cumsum(&t, 0).unwrap();
        assert_eq!(
            along_rows.to_f64_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 5.0, 7.0, 9.0]
        );
    }

    #[test]
    fn cumsum_i64_keeps_dtype() {
        let t = TensorValue::from_i64s(&[3], &[1, 2, 3]).unwrap();
        let c = cumsum(&t, 0).unwrap();
        assert_eq!(c.dtype, DType::I64);
        assert_eq!(c.to_i64_vec().unwrap(), vec![1, 3, 6]);
    }
}
