//! Slice-equivalence conformance for the hand-written batch rules: for
//! every batched input, applying a rule and slicing per batch index must
//! equal the unbatched kernel applied to every input slice.

use fv_conformance::{
    SliceOracle, matrices_3x2x4, op_params, square_matrices_2x3x3, vectors_4x3,
};
use fv_core::{TensorOp, TensorValue};
use fv_dispatch::{BatchRuleRegistry, BatchedValue, OpParams, VmapContext, dispatch};

fn harness() -> (BatchRuleRegistry, VmapContext) {
    (BatchRuleRegistry::with_default_rules(), VmapContext::new())
}

#[test]
fn unsqueeze_matches_per_slice_for_every_valid_axis() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);
    let input = matrices_3x2x4(); // logical rank 2

    for dim in [-3_i64, -2, -1, 0, 1, 2] {
        let params = op_params(&[("dim", &dim.to_string())]);
        oracle.check(TensorOp::Unsqueeze, &input, 0, &params, |slice| {
            fv_kernels::unsqueeze(slice, dim).expect("reference unsqueeze should succeed")
        });
    }
}

#[test]
fn unsqueeze_handles_non_leading_batch_dim() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);
    let input = matrices_3x2x4();

    // treat axis 1 as the batch axis; logical shape is [3, 4]
    let params = op_params(&[("dim", "1")]);
    oracle.check(TensorOp::Unsqueeze, &input, 1, &params, |slice| {
        fv_kernels::unsqueeze(slice, 1).expect("reference unsqueeze should succeed")
    });
}

#[test]
fn repeat_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    let vector_cases: &[&str] = &["2", "1, 3", "2, 2, 2"];
    for sizes in vector_cases {
        let params = op_params(&[("sizes", sizes)]);
        let reference_sizes: Vec<i64> = sizes
            .split(',')
            .map(|s| s.trim().parse().expect("test sizes parse"))
            .collect();
        oracle.check(TensorOp::Repeat, &vectors_4x3(), 0, &params, |slice| {
            fv_kernels::repeat(slice, &reference_sizes).expect("reference repeat should succeed")
        });
    }
}

#[test]
fn flip_matches_per_slice_with_negative_axes() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);
    let input = matrices_3x2x4();

    let axis_cases: &[&[i64]] = &[&[0], &[1], &[-1], &[0, 1], &[-2, -1]];
    for dims in axis_cases {
        let rendered = dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let params = op_params(&[("dims", &rendered)]);
        oracle.check(TensorOp::Flip, &input, 0, &params, |slice| {
            fv_kernels::flip(slice, dims).expect("reference flip should succeed")
        });
    }
}

#[test]
fn diag_rank_one_matches_diag_embed_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    for offset in [-1_i64, 0, 2] {
        let params = op_params(&[("offset", &offset.to_string())]);
        oracle.check(TensorOp::Diag, &vectors_4x3(), 0, &params, |slice| {
            fv_kernels::diag(slice, offset).expect("reference diag should succeed")
        });
    }
}

#[test]
fn diag_concrete_scenario_shape_and_bdim() {
    // B=4 batch of 3-element vectors with bdim 0: output is [4, 3, 3]
    // with bdim 0 and per-slice diagonal matrices.
    let (registry, ctx) = harness();
    let input = BatchedValue::batched(vectors_4x3(), 0);
    let out = dispatch(&registry, &ctx, TensorOp::Diag, &[input], &OpParams::new())
        .expect("diag dispatch should succeed");
    assert_eq!(out.bdim, Some(0));
    assert_eq!(out.value.shape.dims, vec![4, 3, 3]);
    for i in 0..4 {
        let expected = fv_kernels::diag(&vectors_4x3().slice_axis0(i).unwrap(), 0).unwrap();
        assert_eq!(out.value.slice_axis0(i).unwrap(), expected);
    }
}

#[test]
fn diag_rank_two_matches_diagonal_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    for offset in [-1_i64, 0, 1] {
        let params = op_params(&[("offset", &offset.to_string())]);
        oracle.check(TensorOp::Diag, &matrices_3x2x4(), 0, &params, |slice| {
            fv_kernels::diag(slice, offset).expect("reference diag should succeed")
        });
    }
}

#[test]
fn diag_rejects_unsupported_logical_rank_without_partial_result() {
    let (registry, ctx) = harness();
    let input = TensorValue::from_f64s(&[2, 2, 2, 2], &(0..16).map(f64::from).collect::<Vec<_>>())
        .expect("tensor should build");
    let err = dispatch(
        &registry,
        &ctx,
        TensorOp::Diag,
        &[BatchedValue::batched(input, 0)],
        &OpParams::new(),
    )
    .expect_err("logical rank 3 must be rejected");
    let message = err.to_string();
    assert!(message.contains("rank"), "error should describe the rank: {message}");
}

#[test]
fn diagonal_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    let params = op_params(&[("offset", "1"), ("dim1", "0"), ("dim2", "1")]);
    oracle.check(TensorOp::Diagonal, &matrices_3x2x4(), 0, &params, |slice| {
        fv_kernels::diagonal(slice, 1, 0, 1).expect("reference diagonal should succeed")
    });

    let negative_dims = op_params(&[("dim1", "-2"), ("dim2", "-1")]);
    oracle.check(
        TensorOp::Diagonal,
        &square_matrices_2x3x3(),
        0,
        &negative_dims,
        |slice| fv_kernels::diagonal(slice, 0, -2, -1).expect("reference diagonal should succeed"),
    );
}

#[test]
fn sum_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    oracle.check(TensorOp::Sum, &matrices_3x2x4(), 0, &OpParams::new(), |slice| {
        fv_kernels::sum(slice, None).expect("reference sum should succeed")
    });

    let params = op_params(&[("dims", "-1")]);
    oracle.check(TensorOp::Sum, &matrices_3x2x4(), 0, &params, |slice| {
        fv_kernels::sum(slice, Some(&[-1])).expect("reference sum should succeed")
    });
}

#[test]
fn slice_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    let params = op_params(&[("dim", "1"), ("start", "1"), ("end", "3")]);
    oracle.check(TensorOp::Slice, &matrices_3x2x4(), 0, &params, |slice| {
        fv_kernels::slice(slice, 1, 1, 3).expect("reference slice should succeed")
    });
}

#[test]
fn broadcast_to_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    // logical [3] broadcast to [2, 3]: rank grows under the batch axis
    let params = op_params(&[("size", "2, 3")]);
    oracle.check(TensorOp::BroadcastTo, &vectors_4x3(), 0, &params, |slice| {
        fv_kernels::broadcast_to(slice, &[2, 3]).expect("reference broadcast should succeed")
    });
}

#[test]
fn triangle_rules_match_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    for diagonal in [-1_i64, 0, 1] {
        let params = op_params(&[("diagonal", &diagonal.to_string())]);
        oracle.check(
            TensorOp::Tril,
            &square_matrices_2x3x3(),
            0,
            &params,
            |slice| fv_kernels::tril(slice, diagonal).expect("reference tril should succeed"),
        );
        oracle.check(
            TensorOp::Triu,
            &square_matrices_2x3x3(),
            0,
            &params,
            |slice| fv_kernels::triu(slice, diagonal).expect("reference triu should succeed"),
        );
    }
}

#[test]
fn unsafe_view_keeps_bdim_and_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    // logical [2, 4] viewed as [8]
    let params = op_params(&[("size", "8")]);
    oracle.check(TensorOp::UnsafeView, &matrices_3x2x4(), 0, &params, |slice| {
        fv_kernels::unsafe_view(slice, &[8]).expect("reference view should succeed")
    });

    // non-leading batch dim keeps its position
    let input = matrices_3x2x4();
    let out = dispatch(
        &registry,
        &ctx,
        TensorOp::UnsafeView,
        &[BatchedValue::batched(input, 1)],
        &op_params(&[("size", "3, 4")]),
    )
    .expect("view dispatch should succeed");
    assert_eq!(out.bdim, Some(1));
    assert_eq!(out.value.shape.dims, vec![3, 2, 4]);
}

#[test]
fn fallback_cumsum_matches_per_slice() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);

    for dim in [0_i64, 1, -1] {
        let params = op_params(&[("dim", &dim.to_string())]);
        oracle.check(TensorOp::Cumsum, &matrices_3x2x4(), 0, &params, |slice| {
            fv_kernels::cumsum(slice, dim).expect("reference cumsum should succeed")
        });
    }
}

#[test]
fn absent_bdim_is_identical_to_direct_kernel_call() {
    let (registry, ctx) = harness();
    let oracle = SliceOracle::new(&registry, &ctx);
    let input = matrices_3x2x4();

    oracle.check_unbatched_identity(
        TensorOp::Flip,
        &input,
        &op_params(&[("dims", "0, -1")]),
        |t| fv_kernels::flip(t, &[0, -1]).expect("reference flip should succeed"),
    );
    oracle.check_unbatched_identity(
        TensorOp::Unsqueeze,
        &input,
        &op_params(&[("dim", "-1")]),
        |t| fv_kernels::unsqueeze(t, -1).expect("reference unsqueeze should succeed"),
    );
    oracle.check_unbatched_identity(TensorOp::Sum, &input, &OpParams::new(), |t| {
        fv_kernels::sum(t, None).expect("reference sum should succeed")
    });
    oracle.check_unbatched_identity(
        TensorOp::Cumsum,
        &input,
        &op_params(&[("dim", "0")]),
        |t| fv_kernels::cumsum(t, 0).expect("reference cumsum should succeed"),
    );
}
