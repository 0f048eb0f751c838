use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use podrom::{
    BasisBuilder, CorrelationBuilder, Decomposer, EigenRequest, FieldSnapshot, KrylovDecomposer, SnapshotSet,
};

/// Low-rank field snapshots with a little noise on top.
fn random_set(snapshots: usize, cells: usize, seed: u64) -> SnapshotSet<FieldSnapshot> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let shapes: Vec<DVector<f64>> = (0..8)
        .map(|h| DVector::from_fn(cells, |i, _| ((h + 1) as f64 * i as f64 / cells as f64 * 6.0).sin()))
        .collect();
    let payloads = (0..snapshots)
        .map(|_| {
            let mut values = DVector::from_fn(cells, |_, _| 1e-3 * rng.gen::<f64>());
            for (h, shape) in shapes.iter().enumerate() {
                values.axpy(rng.gen::<f64>() / (h + 1) as f64, shape, 1.0);
            }
            FieldSnapshot::uniform(values)
        })
        .collect();
    SnapshotSet::new("U", payloads).expect("snapshot set")
}

fn bench_pod_pipeline(c: &mut Criterion) {
    let small = random_set(40, 2_000, 42);
    let medium = random_set(120, 5_000, 7);

    let mut group = c.benchmark_group("pod_pipeline");

    group.bench_function("correlation_40x2000", |b| {
        b.iter(|| {
            let correlation = CorrelationBuilder::from_set(&small);
            black_box(correlation);
        });
    });

    let correlation = CorrelationBuilder::from_set(&medium);
    let decomposer = KrylovDecomposer::default();
    group.bench_function("krylov_120_top10", |b| {
        b.iter(|| {
            let pairs = decomposer
                .decompose(&correlation, EigenRequest::largest(10))
                .expect("eigenpairs");
            black_box(pairs);
        });
    });

    let builder = BasisBuilder::default();
    group.bench_function("basis_40x2000_8_modes", |b| {
        b.iter(|| {
            let basis = builder.build(&small, 8).expect("basis");
            black_box(basis);
        });
    });

    group.bench_function("svd_basis_40x2000_8_modes", |b| {
        b.iter(|| {
            let basis = builder.build_svd(&small, 8).expect("svd basis");
            black_box(basis);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pod_pipeline);
criterion_main!(benches);
