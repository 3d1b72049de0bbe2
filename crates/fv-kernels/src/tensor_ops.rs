//! Shape-manipulation kernels: axis insertion and movement, tiling,
//! broadcasting, reshaping, slicing, flipping, and the in-place resize.

use fv_core::{Literal, Shape, TensorOp, TensorValue, maybe_wrap_dim};

use crate::{KernelError, checked_element_count, contiguous_strides};

/// Insert a size-1 axis at `dim`, which is wrapped against `rank + 1`.
pub fn unsqueeze(t: &TensorValue, dim: i64) -> Result<TensorValue, KernelError> {
    let wrapped = maybe_wrap_dim(dim, t.rank() + 1)?;
    let mut dims = t.shape.dims.clone();
    dims.insert(wrapped, 1);
    Ok(TensorValue::new(
        t.dtype,
        Shape { dims },
        t.elements.clone(),
    )?)
}

/// Permute the axes of a tensor. `perm` must be a valid permutation of
/// `0..rank`; callers construct it, so violations are programmer error.
fn permute(t: &TensorValue, perm: &[usize]) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    assert_eq!(perm.len(), rank, "permutation length must match rank");

    let old_dims = &t.shape.dims;
    let new_dims: Vec<u32> = perm.iter().map(|&p| old_dims[p]).collect();
    let old_strides = contiguous_strides(old_dims);
    let new_strides = contiguous_strides(&new_dims);

    let mut new_elements = Vec::with_capacity(t.elements.len());
    for flat in 0..t.elements.len() {
        let mut remaining = flat;
        let mut old_flat = 0_usize;
        for axis in 0..rank {
            let coord = remaining / new_strides[axis];
            remaining %= new_strides[axis];
            old_flat += coord * old_strides[perm[axis]];
        }
        new_elements.push(t.elements[old_flat]);
    }

    Ok(TensorValue::new(
        t.dtype,
        Shape { dims: new_dims },
        new_elements,
    )?)
}

/// Move one axis from `source` to `destination`, preserving the relative
/// order of the remaining axes.
pub fn movedim(t: &TensorValue, source: i64, destination: i64) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    let src = maybe_wrap_dim(source, rank)?;
    let dst = maybe_wrap_dim(destination, rank)?;
    if src == dst {
        return Ok(t.clone());
    }
    let mut perm: Vec<usize> = (0..rank).filter(|&axis| axis != src).collect();
    perm.insert(dst, src);
    permute(t, &perm)
}

/// Reverse the listed axes.
pub fn flip(t: &TensorValue, dims: &[i64]) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    let mut flip_axis = vec![false; rank];
    for &d in dims {
        let wrapped = maybe_wrap_dim(d, rank)?;
        if flip_axis[wrapped] {
            return Err(KernelError::InvalidParam {
                op: TensorOp::Flip,
                key: "dims",
                detail: format!("axis {wrapped} listed more than once"),
            });
        }
        flip_axis[wrapped] = true;
    }

    let strides = contiguous_strides(&t.shape.dims);
    let mut new_elements = Vec::with_capacity(t.elements.len());
    for flat in 0..t.elements.len() {
        let mut remaining = flat;
        let mut in_flat = 0_usize;
        for axis in 0..rank {
            let coord = remaining / strides[axis];
            remaining %= strides[axis];
            let in_coord = if flip_axis[axis] {
                t.shape.dims[axis] as usize - 1 - coord
            } else {
                coord
            };
            in_flat += in_coord * strides[axis];
        }
        new_elements.push(t.elements[in_flat]);
    }

    Ok(TensorValue::new(t.dtype, t.shape.clone(), new_elements)?)
}

/// Element-count-preserving reshape. No `-1` size inference: every
/// requested dim must be explicit and non-negative.
pub fn unsafe_view(t: &TensorValue, size: &[i64]) -> Result<TensorValue, KernelError> {
    let dims = non_negative_dims(TensorOp::UnsafeView, "size", size)?;
    let shape = Shape { dims };
    let count = checked_element_count(TensorOp::UnsafeView, &shape)?;
    if count != t.elements.len() {
        return Err(KernelError::ShapeMismatch {
            op: TensorOp::UnsafeView,
            left: t.shape.clone(),
            right: shape,
        });
    }
    Ok(TensorValue::new(t.dtype, shape, t.elements.clone())?)
}

/// Broadcast to a larger shape, numpy-style: sizes are right-aligned and
/// each input dim must equal the target dim or be 1.
pub fn broadcast_to(t: &TensorValue, size: &[i64]) -> Result<TensorValue, KernelError> {
    let out_dims = non_negative_dims(TensorOp::BroadcastTo, "size", size)?;
    let in_rank = t.rank();
    let out_rank = out_dims.len();
    if in_rank > out_rank {
        return Err(KernelError::ShapeMismatch {
            op: TensorOp::BroadcastTo,
            left: t.shape.clone(),
            right: Shape { dims: out_dims },
        });
    }
    let offset = out_rank - in_rank;
    for (j, &in_dim) in t.shape.dims.iter().enumerate() {
        let out_dim = out_dims[offset + j];
        if in_dim != out_dim && in_dim != 1 {
            return Err(KernelError::ShapeMismatch {
                op: TensorOp::BroadcastTo,
                left: t.shape.clone(),
                right: Shape { dims: out_dims },
            });
        }
    }

    let out_shape = Shape { dims: out_dims };
    let total = checked_element_count(TensorOp::BroadcastTo, &out_shape)?;
    let in_strides = contiguous_strides(&t.shape.dims);
    let out_strides = contiguous_strides(&out_shape.dims);

    let mut new_elements = Vec::with_capacity(total);
    for flat in 0..total {
        let mut remaining = flat;
        let mut in_flat = 0_usize;
        for axis in 0..out_rank {
            let coord = remaining / out_strides[axis];
            remaining %= out_strides[axis];
            if axis >= offset {
                let j = axis - offset;
                if t.shape.dims[j] != 1 {
                    in_flat += coord * in_strides[j];
                }
            }
        }
        new_elements.push(t.elements[in_flat]);
    }

    Ok(TensorValue::new(t.dtype, out_shape, new_elements)?)
}

/// Tile a tensor. `sizes` gives a per-axis repeat factor and must have at
/// least as many entries as the tensor has axes; missing leading axes are
/// implicitly size-1.
pub fn repeat(t: &TensorValue, sizes: &[i64]) -> Result<TensorValue, KernelError> {
    if sizes.len() < t.rank() {
        return Err(KernelError::InvalidParam {
            op: TensorOp::Repeat,
            key: "sizes",
            detail: format!(
                "number of repeat factors ({}) cannot be smaller than the tensor rank ({})",
                sizes.len(),
                t.rank()
            ),
        });
    }
    let factors = non_negative_dims(TensorOp::Repeat, "sizes", sizes)?;

    let out_rank = factors.len();
    let offset = out_rank - t.rank();
    let mut padded_dims = vec![1_u32; offset];
    padded_dims.extend_from_slice(&t.shape.dims);

    let out_dims: Vec<u32> = padded_dims
        .iter()
        .zip(factors.iter())
        .map(|(&d, &r)| d * r)
        .collect();
    let out_shape = Shape { dims: out_dims };
    let total = checked_element_count(TensorOp::Repeat, &out_shape)?;

    let in_strides = contiguous_strides(&padded_dims);
    let out_strides = contiguous_strides(&out_shape.dims);

    let mut new_elements = Vec::with_capacity(total);
    for flat in 0..total {
        let mut remaining = flat;
        let mut in_flat = 0_usize;
        for axis in 0..out_rank {
            let coord = remaining / out_strides[axis];
            remaining %= out_strides[axis];
            in_flat += (coord % padded_dims[axis] as usize) * in_strides[axis];
        }
        new_elements.push(t.elements[in_flat]);
    }

    Ok(TensorValue::new(t.dtype, out_shape, new_elements)?)
}

/// Contiguous sub-range along one axis: `[start, end)`. Negative `start`
/// and `end` count from the end of the axis.
pub fn slice(t: &TensorValue, dim: i64, start: i64, end: i64) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    let d = maybe_wrap_dim(dim, rank)?;
    if rank == 0 {
        return Err(KernelError::Unsupported {
            op: TensorOp::Slice,
            detail: "slice expects a tensor with at least 1 dimension".to_owned(),
        });
    }
    let dim_size = t.shape.dims[d] as i64;
    let resolved_start = if start < 0 { start + dim_size } else { start };
    let resolved_end = if end < 0 { end + dim_size } else { end };
    if resolved_start < 0 || resolved_end < resolved_start || resolved_end > dim_size {
        return Err(KernelError::InvalidParam {
            op: TensorOp::Slice,
            key: "start",
            detail: format!(
                "range [{start}, {end}) is invalid for axis {d} of size {dim_size}"
            ),
        });
    }

    let mut out_dims = t.shape.dims.clone();
    out_dims[d] = (resolved_end - resolved_start) as u32;
    let out_shape = Shape { dims: out_dims };
    let total = checked_element_count(TensorOp::Slice, &out_shape)?;

    let in_strides = contiguous_strides(&t.shape.dims);
    let out_strides = contiguous_strides(&out_shape.dims);

    let mut new_elements = Vec::with_capacity(total);
    for flat in 0..total {
        let mut remaining = flat;
        let mut in_flat = 0_usize;
        for axis in 0..rank {
            let mut coord = remaining / out_strides[axis];
            remaining %= out_strides[axis];
            if axis == d {
                coord += resolved_start as usize;
            }
            in_flat += coord * in_strides[axis];
        }
        new_elements.push(t.elements[in_flat]);
    }

    Ok(TensorValue::new(t.dtype, out_shape, new_elements)?)
}

/// In-place storage resize: the flat data prefix is kept, growth is
/// zero-filled, shrinkage truncates.
pub fn resize_(t: &mut TensorValue, size: &[u32]) -> Result<(), KernelError> {
    let shape = Shape {
        dims: size.to_vec(),
    };
    let count = checked_element_count(TensorOp::Resize, &shape)?;
    if count <= t.elements.len() {
        t.elements.truncate(count);
    } else {
        let fill = Literal::zero(t.dtype);
        t.elements.resize(count, fill);
    }
    t.shape = shape;
    Ok(())
}

fn non_negative_dims(
    op: TensorOp,
    key: &'static str,
    raw: &[i64],
) -> Result<Vec<u32>, KernelError> {
    raw.iter()
        .map(|&d| {
            u32::try_from(d).map_err(|_| KernelError::InvalidParam {
                op,
                key,
                detail: format!("invalid dim {d}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsqueeze_inserts_axis() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(unsqueeze(&t, 0).unwrap().shape.dims, vec![1, 2, 3]);
        assert_eq!(unsqueeze(&t, 2).unwrap().shape.dims, vec![2, 3, 1]);
        assert_eq!(unsqueeze(&t, -1).unwrap().shape.dims, vec![2, 3, 1]);
        assert_eq!(unsqueeze(&t, -3).unwrap().shape.dims, vec![1, 2, 3]);
    }

    #[test]
    fn movedim_moves_axis_preserving_order() {
        // shape [2, 3, 4], move axis 0 to the back
        let values: Vec<f64> = (0..24).map(f64::from).collect();
        let t = TensorValue::from_f64s(&[2, 3, 4], &values).unwrap();
        let moved = movedim(&t, 0, -1).unwrap();
        assert_eq!(moved.shape.dims, vec![3, 4, 2]);
        // element at [i, j, k] of original lands at [j, k, i]
        let out = moved.to_f64_vec().unwrap();
        assert_eq!(out[0], 0.0); // [0,0,0]
        assert_eq!(out[1], 12.0); // [0,0,1] <- original [1,0,0]
        assert_eq!(out[2], 1.0); // [0,1,0] <- original [0,0,1]
    }

    #[test]
    fn movedim_round_trips() {
        let values: Vec<f64> = (0..24).map(f64::from).collect();
        let t = TensorValue::from_f64s(&[2, 3, 4], &values).unwrap();
        let there = movedim(&t, 1, 0).unwrap();
        let back = movedim(&there, 0, 1).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn flip_reverses_requested_axes() {
        let t = TensorValue::from_f64s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let flipped = flip(&t, &[0]).unwrap();
        assert_eq!(flipped.to_f64_vec().unwrap(), vec![3.0, 4.0, 1.0, 2.0]);
        let flipped_both = flip(&t, &[0, -1]).unwrap();
        assert_eq!(flipped_both.to_f64_vec().unwrap(), vec![4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn flip_rejects_duplicate_axes() {
        let t = TensorValue::from_f64s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(flip(&t, &[1, -1]).is_err());
    }

    #[test]
    fn unsafe_view_preserves_element_order() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let viewed = unsafe_view(&t, &[3, 2]).unwrap();
        assert_eq!(viewed.shape.dims, vec![3, 2]);
        assert_eq!(viewed.elements, t.elements);
        assert!(unsafe_view(&t, &[4, 2]).is_err());
    }

    #[test]
    fn broadcast_to_expands_singleton_axes() {
        let t = TensorValue::from_f64s(&[1, 2], &[1.0, 2.0]).unwrap();
        let b = broadcast_to(&t, &[3, 2]).unwrap();
        assert_eq!(b.shape.dims, vec![3, 2]);
        assert_eq!(
            b.to_f64_vec().unwrap(),
            vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]
        );
        // right-aligned: a vector broadcasts against a new leading axis
        let v = TensorValue::vector_f64(&[5.0, 6.0]).unwrap();
        let b2 = broadcast_to(&v, &[2, 2]).unwrap();
        assert_eq!(b2.to_f64_vec().unwrap(), vec![5.0, 6.0, 5.0, 6.0]);
    }

    #[test]
    fn broadcast_to_rejects_incompatible_dims() {
        let t = TensorValue::from_f64s(&[3], &[1.0, 2.0, 3.0]).unwrap();
        assert!(broadcast_to(&t, &[2]).is_err());
        assert!(broadcast_to(&t, &[]).is_err());
    }

    #[test]
    fn repeat_tiles_and_pads_rank() {
        let t = TensorValue::vector_f64(&[1.0, 2.0]).unwrap();
        let r = repeat(&t, &[2]).unwrap();
        assert_eq!(r.to_f64_vec().unwrap(), vec![1.0, 2.0, 1.0, 2.0]);
        // rank padding: vector repeated into a matrix
        let r2 = repeat(&t, &[3, 2]).unwrap();
        assert_eq!(r2.shape.dims, vec![3, 4]);
        assert_eq!(
            r2.to_f64_vec().unwrap(),
            vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0]
        );
        assert!(repeat(&t, &[]).is_err());
    }

    #[test]
    fn slice_extracts_sub_range() {
        let t = TensorValue::from_f64s(&[2, 4], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])
            .unwrap();
        let s = slice(&t, 1, 1, 3).unwrap();
        assert_eq!(s.shape.dims, vec![2, 2]);
        assert_eq!(s.to_f64_vec().unwrap(), vec![1.0, 2.0, 5.0, 6.0]);
        let neg = slice(&t, -1, -3, -1).unwrap();
        assert_eq!(neg, s);
        assert!(slice(&t, 1, 3, 1).is_err());
        assert!(slice(&t, 1, 0, 5).is_err());
    }

    #[test]
    fn resize_grows_with_zeros_and_truncates() {
        let mut t = TensorValue::from_f64s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        resize_(&mut t, &[3, 2]).unwrap();
        assert_eq!(t.shape.dims, vec![3, 2]);
        assert_eq!(
            t.to_f64_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0]
        );
        resize_(&mut t, &[2]).unwrap();
        assert_eq!(t.to_f64_vec().unwrap(), vec![1.0, 2.0]);
    }
}
