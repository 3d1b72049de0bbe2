use criterion::{Criterion, criterion_group, criterion_main};
use fv_core::{TensorOp, TensorValue};
use fv_dispatch::{BatchRuleRegistry, BatchedValue, OpParams, VmapContext, dispatch};

fn flip_params() -> OpParams {
    let mut params = OpParams::new();
    params.insert("dims".to_owned(), "0, 1".to_owned());
    params
}

fn benchmark_dispatch(c: &mut Criterion) {
    let registry = BatchRuleRegistry::with_default_rules();
    let ctx = VmapContext::new();
    let values: Vec<f64> = (0..96).map(f64::from).collect();
    let tensor = TensorValue::from_f64s(&[8, 4, 3], &values).expect("bench tensor should build");
    let params = flip_params();

    c.bench_function("dispatch/flip_batched", |b| {
        b.iter(|| {
            let input = BatchedValue::batched(tensor.clone(), 0);
            let out = dispatch(&registry, &ctx, TensorOp::Flip, &[input], &params)
                .expect("dispatch benchmark call should succeed");
            assert_eq!(out.bdim, Some(0));
        });
    });

    c.bench_function("dispatch/flip_unbatched", |b| {
        b.iter(|| {
            let input = BatchedValue::unbatched(tensor.clone());
            let out = dispatch(&registry, &ctx, TensorOp::Flip, &[input], &params)
                .expect("dispatch benchmark call should succeed");
            assert_eq!(out.bdim, None);
        });
    });
}

criterion_group!(dispatch_benches, benchmark_dispatch);
criterion_main!(dispatch_benches);
