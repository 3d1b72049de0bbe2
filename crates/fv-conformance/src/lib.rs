#![forbid(unsafe_code)]

//! Conformance harness for batched execution.
//!
//! The central oracle: a batch rule is correct when its output, sliced
//! per batch index, equals the unbatched reference applied to the
//! corresponding input slice.

use fv_core::{TensorOp, TensorValue};
use fv_dispatch::{
    BatchRuleRegistry, BatchedValue, OpParams, VmapContext, dispatch, move_batch_dim_to_front,
};
use serde::Serialize;

/// Serializable description of one conformance case, digested into a
/// stable case id for assertion messages.
#[derive(Debug, Serialize)]
pub struct CaseFixture<'a> {
    pub op: &'static str,
    pub input_dims: &'a [u32],
    pub bdim: Option<usize>,
    pub params: &'a OpParams,
}

#[must_use]
pub fn case_id(op: TensorOp, input: &TensorValue, bdim: Option<usize>, params: &OpParams) -> String {
    let fixture = CaseFixture {
        op: op.as_str(),
        input_dims: &input.shape.dims,
        bdim,
        params,
    };
    fv_test_utils::fixture_id_from_json(&fixture).expect("fixture digest should build")
}

/// Slice-equivalence oracle over a single-input operator.
pub struct SliceOracle<'a> {
    pub registry: &'a BatchRuleRegistry,
    pub ctx: &'a VmapContext,
}

impl<'a> SliceOracle<'a> {
    #[must_use]
    pub fn new(registry: &'a BatchRuleRegistry, ctx: &'a VmapContext) -> Self {
        Self { registry, ctx }
    }

    /// Dispatch `op` over `input` batched at `bdim` and require that every
    /// batch slice of the output equals `reference` applied to the
    /// corresponding input slice.
    pub fn check(
        &self,
        op: TensorOp,
        input: &TensorValue,
        bdim: usize,
        params: &OpParams,
        reference: impl Fn(&TensorValue) -> TensorValue,
    ) {
        let id = case_id(op, input, Some(bdim), params);
        let batched = BatchedValue::batched(input.clone(), bdim);
        let out = dispatch(self.registry, self.ctx, op, &[batched], params)
            .unwrap_or_else(|err| panic!("case {id}: dispatch failed: {err}"));
        let out_bdim = out
            .bdim
            .unwrap_or_else(|| panic!("case {id}: batched input produced unbatched output"));
        let canonical = move_batch_dim_to_front(&out.value, Some(out_bdim))
            .unwrap_or_else(|err| panic!("case {id}: move to front failed: {err}"));

        let input_front = move_batch_dim_to_front(input, Some(bdim))
            .unwrap_or_else(|err| panic!("case {id}: move to front failed: {err}"));
        let batch_size = input_front.shape.dims[0] as usize;
        assert_eq!(
            canonical.shape.dims.first().copied(),
            Some(batch_size as u32),
            "case {id}: output batch size mismatch"
        );

        for index in 0..batch_size {
            let got = canonical
                .slice_axis0(index)
                .unwrap_or_else(|err| panic!("case {id}: output slice failed: {err}"));
            let input_slice = input_front
                .slice_axis0(index)
                .unwrap_or_else(|err| panic!("case {id}: input slice failed: {err}"));
            let expected = reference(&input_slice);
            assert_eq!(got, expected, "case {id}: mismatch at batch index {index}");
        }
    }

    /// Dispatch `op` with an absent batch dim and require the result to be
    /// identical to the direct unbatched call, with an absent result bdim.
    pub fn check_unbatched_identity(
        &self,
        op: TensorOp,
        input: &TensorValue,
        params: &OpParams,
        reference: impl Fn(&TensorValue) -> TensorValue,
    ) {
        let id = case_id(op, input, None, params);
        let out = dispatch(
            self.registry,
            self.ctx,
            op,
            &[BatchedValue::unbatched(input.clone())],
            params,
        )
        .unwrap_or_else(|err| panic!("case {id}: dispatch failed: {err}"));
        assert_eq!(out.bdim, None, "case {id}: unbatched input produced a bdim");
        assert_eq!(out.value, reference(input), "case {id}: mismatch");
    }
}

/// Batch of four 3-vectors used across suites.
#[must_use]
pub fn vectors_4x3() -> TensorValue {
    TensorValue::from_f64s(
        &[4, 3],
        &[
            1.0, 2.0, 3.0, //
            4.0, 5.0, 6.0, //
            7.0, 8.0, 9.0, //
            10.0, 11.0, 12.0,
        ],
    )
    .expect("fixture tensor should build")
}

/// Batch of three 2x4 matrices.
#[must_use]
pub fn matrices_3x2x4() -> TensorValue {
    let values: Vec<f64> = (0..24).map(|v| f64::from(v) - 7.5).collect();
    TensorValue::from_f64s(&[3, 2, 4], &values).expect("fixture tensor should build")
}

/// Batch of two 3x3 matrices.
#[must_use]
pub fn square_matrices_2x3x3() -> TensorValue {
    let values: Vec<f64> = (1..=18).map(f64::from).collect();
    TensorValue::from_f64s(&[2, 3, 3], &values).expect("fixture tensor should build")
}

#[must_use]
pub fn op_params(pairs: &[(&str, &str)]) -> OpParams {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}
