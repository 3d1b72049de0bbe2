//! Diagonal-family kernels: diag, diagonal extraction, diag_embed, and
//! the triangle masks.

use fv_core::{Literal, Shape, TensorOp, TensorValue, maybe_wrap_dim};

use crate::{KernelError, checked_element_count, contiguous_strides};

/// Rank-dependent diag: a 1-D input is embedded into the `offset` diagonal
/// of a square matrix; a 2-D input has that diagonal extracted. Any other
/// rank is an error.
pub fn diag(t: &TensorValue, offset: i64) -> Result<TensorValue, KernelError> {
    match t.rank() {
        1 => embed_vector(t, offset),
        2 => diagonal(t, offset, 0, 1),
        rank => Err(KernelError::Unsupported {
            op: TensorOp::Diag,
            detail: format!("diag expects a 1-D or 2-D tensor, got rank {rank}"),
        }),
    }
}

fn embed_vector(t: &TensorValue, offset: i64) -> Result<TensorValue, KernelError> {
    let n = t.shape.dims[0] as usize;
    let m = n + offset.unsigned_abs() as usize;
    let out_shape = Shape {
        dims: vec![m as u32, m as u32],
    };
    let total = checked_element_count(TensorOp::Diag, &out_shape)?;
    let mut elements = vec![Literal::zero(t.dtype); total];
    for (i, &value) in t.elements.iter().enumerate() {
        let (row, col) = if offset >= 0 {
            (i, i + offset as usize)
        } else {
            (i + (-offset) as usize, i)
        };
        elements[row * m + col] = value;
    }
    Ok(TensorValue::new(t.dtype, out_shape, elements)?)
}

/// General diagonal extraction: removes `dim1` and `dim2` and appends the
/// diagonal axis last.
pub fn diagonal(
    t: &TensorValue,
    offset: i64,
    dim1: i64,
    dim2: i64,
) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    let d1 = maybe_wrap_dim(dim1, rank)?;
    let d2 = maybe_wrap_dim(dim2, rank)?;
    if d1 == d2 {
        return Err(KernelError::InvalidParam {
            op: TensorOp::Diagonal,
            key: "dim2",
            detail: "diagonal dimensions cannot be identical".to_owned(),
        });
    }

    let s1 = t.shape.dims[d1] as i64;
    let s2 = t.shape.dims[d2] as i64;
    let diag_len = if offset >= 0 {
        s1.min(s2 - offset)
    } else {
        (s1 + offset).min(s2)
    }
    .max(0) as u32;

    let other_axes: Vec<usize> = (0..rank).filter(|&a| a != d1 && a != d2).collect();
    let mut out_dims: Vec<u32> = other_axes.iter().map(|&a| t.shape.dims[a]).collect();
    out_dims.push(diag_len);
    let out_shape = Shape { dims: out_dims };
    let total = checked_element_count(TensorOp::Diagonal, &out_shape)?;

    let in_strides = contiguous_strides(&t.shape.dims);
    let out_strides = contiguous_strides(&out_shape.dims);
    let out_rank = out_shape.rank();

    let mut new_elements = Vec::with_capacity(total);
    for flat in 0..total {
        let mut remaining = flat;
        let mut in_flat = 0_usize;
        for axis in 0..out_rank {
            let coord = remaining / out_strides[axis];
            remaining %= out_strides[axis];
            if axis + 1 == out_rank {
                let (row, col) = if offset >= 0 {
                    (coord, coord + offset as usize)
                } else {
                    (coord + (-offset) as usize, coord)
                };
                in_flat += row * in_strides[d1] + col * in_strides[d2];
            } else {
                in_flat += coord * in_strides[other_axes[axis]];
            }
        }
        new_elements.push(t.elements[in_flat]);
    }

    Ok(TensorValue::new(t.dtype, out_shape, new_elements)?)
}

/// Embed the last axis into the `offset` diagonal of a new trailing
/// matrix pair: `[..., n]` becomes `[..., m, m]` with `m = n + |offset|`.
pub fn diag_embed(t: &TensorValue, offset: i64) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    if rank == 0 {
        return Err(KernelError::Unsupported {
            op: TensorOp::DiagEmbed,
            detail: "diag_embed expects a tensor with at least 1 dimension".to_owned(),
        });
    }
    let n = t.shape.dims[rank - 1] as usize;
    let m = n + offset.unsigned_abs() as usize;

    let mut out_dims = t.shape.dims[..rank - 1].to_vec();
    out_dims.push(m as u32);
    out_dims.push(m as u32);
    let out_shape = Shape { dims: out_dims };
    let total = checked_element_count(TensorOp::DiagEmbed, &out_shape)?;

    let mut elements = vec![Literal::zero(t.dtype); total];
    for (flat, &value) in t.elements.iter().enumerate() {
        let lead = flat / n.max(1);
        let i = flat % n.max(1);
        let (row, col) = if offset >= 0 {
            (i, i + offset as usize)
        } else {
            (i + (-offset) as usize, i)
        };
        elements[(lead * m + row) * m + col] = value;
    }
    Ok(TensorValue::new(t.dtype, out_shape, elements)?)
}

/// Lower triangle of the last two axes: keeps `col - row <= diagonal`.
pub fn tril(t: &TensorValue, diagonal: i64) -> Result<TensorValue, KernelError> {
    triangle(t, TensorOp::Tril, |row, col| col - row <= diagonal)
}

/// Upper triangle of the last two axes: keeps `col - row >= diagonal`.
pub fn triu(t: &TensorValue, diagonal: i64) -> Result<TensorValue, KernelError> {
    triangle(t, TensorOp::Triu, |row, col| col - row >= diagonal)
}

fn triangle(
    t: &TensorValue,
    op: TensorOp,
    keep: impl Fn(i64, i64) -> bool,
) -> Result<TensorValue, KernelError> {
    let rank = t.rank();
    if rank < 2 {
        return Err(KernelError::Unsupported {
            op,
            detail: format!(
                "{} expects a tensor with at least 2 dimensions, got rank {rank}",
                op.as_str()
            ),
        });
    }
    let rows = t.shape.dims[rank - 2] as usize;
    let cols = t.shape.dims[rank - 1] as usize;
    let zero = Literal::zero(t.dtype);

    let elements = t
        .elements
        .iter()
        .enumerate()
        .map(|(flat, &value)| {
            let col = (flat % cols.max(1)) as i64;
            let row = ((flat / cols.max(1)) % rows.max(1)) as i64;
            if keep(row, col) { value } else { zero }
        })
        .collect();

    Ok(TensorValue::new(t.dtype, t.shape.clone(), elements)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diag_embeds_vector_on_main_diagonal() {
        let t = TensorValue::vector_f64(&[1.0, 2.0, 3.0]).unwrap();
        let d = diag(&t, 0).unwrap();
        assert_eq!(d.shape.dims, vec![3, 3]);
        assert_eq!(
            d.to_f64_vec().unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 3.0]
        );
    }

    #[test]
    fn diag_embeds_vector_with_offset() {
        let t = TensorValue::vector_f64(&[1.0, 2.0]).unwrap();
        let d = diag(&t, 1).unwrap();
        assert_eq!(d.shape.dims, vec![3, 3]);
        assert_eq!(
            d.to_f64_vec().unwrap(),
            vec![0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0]
        );
        let d_neg = diag(&t, -1).unwrap();
        assert_eq!(
            d_neg.to_f64_vec().unwrap(),
            vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 0.0]
        );
    }

    #[test]
    fn diag_extracts_matrix_diagonal() {
        let t = TensorValue::from_f64s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(diag(&t, 0).unwrap().to_f64_vec().unwrap(), vec![1.0, 5.0]);
        assert_eq!(
            diag(&t, 1).unwrap().to_f64_vec().unwrap(),
            vec![2.0, 6.0]
        );
        assert_eq!(diag(&t, -1).unwrap().to_f64_vec().unwrap(), vec![4.0]);
    }

    #[test]
    fn diag_rejects_other_ranks() {
        let scalar = TensorValue::scalar_f64(1.0);
        assert!(matches!(
            diag(&scalar, 0).unwrap_err(),
            KernelError::Unsupported { op: TensorOp::Diag, .. }
        ));
        let cube = TensorValue::from_f64s(&[1, 1, 1], &[1.0]).unwrap();
        assert!(diag(&cube, 0).is_err());
    }

    #[test]
    fn diagonal_appends_diag_axis_last() {
        // shape [2, 2, 2]: two stacked 2x2 matrices over dims 1 and 2
        let t = TensorValue::from_f64s(
            &[2, 2, 2],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        )
        .unwrap();
        let d = diagonal(&t, 0, 1, 2).unwrap();
        assert_eq!(d.shape.dims, vec![2, 2]);
        assert_eq!(d.to_f64_vec().unwrap(), vec![1.0, 4.0, 5.0, 8.0]);
    }

    #[test]
    fn diagonal_rejects_identical_dims() {
        let t = TensorValue::from_f64s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(diagonal(&t, 0, 1, -1).is_err());
    }

    #[test]
    fn diag_embed_builds_batch_of_matrices() {
        let t = TensorValue::from_f64s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let d = diag_embed(&t, 0).unwrap();
        assert_eq!(d.shape.dims, vec![2, 2, 2]);
        assert_eq!(
            d.to_f64_vec().unwrap(),
            vec![1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0]
        );
    }

    #[test]
    fn tril_and_triu_mask_triangles() {
        let t = TensorValue::from_f64s(&[3, 3], &(1..=9).map(f64::from).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(
            tril(&t, 0).unwrap().to_f64_vec().unwrap(),
            vec![1.0, 0.0, 0.0, 4.0, 5.0, 0.0, 7.0, 8.0, 9.0]
        );
        assert_eq!(
            triu(&t, 0).unwrap().to_f64_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 0.0, 5.0, 6.0, 0.0, 0.0, 9.0]
        );
        assert_eq!(
            tril(&t, -1).unwrap().to_f64_vec().unwrap(),
            vec![0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 7.0, 8.0, 0.0]
        );
    }

    #[test]
    fn triangle_requires_rank_two() {
        let t = TensorValue::vector_f64(&[1.0]).unwrap();
        assert!(tril(&t, 0).is_err());
    }
}
