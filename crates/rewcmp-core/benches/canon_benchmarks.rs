use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array3;
use rewcmp_core::{
    canonicalize, deshape_pearson_distance, DeshapeKind, FixedPointConfig, RewardTensor, TransitionDistribution,
};

fn reward(n_states: usize, n_actions: usize) -> RewardTensor {
    RewardTensor::new(Array3::from_shape_fn((n_states, n_actions, n_states), |(s, a, s2)| {
        ((s * 31 + a * 17 + s2 * 7) % 13) as f64 - 6.0
    }))
    .expect("finite square tensor")
}

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");
    let config = FixedPointConfig::default();
    for n_states in [16, 64] {
        let r = reward(n_states, 5);
        let dist = TransitionDistribution::uniform(n_states, 5);
        for kind in DeshapeKind::ALL {
            group.bench_function(BenchmarkId::new(kind.as_str(), n_states), |b| {
                b.iter(|| canonicalize(black_box(&r), &dist, 0.99, kind, &config).expect("canonicalize"));
            });
        }
    }
    group.finish();
}

fn bench_pearson(c: &mut Criterion) {
    let a = reward(64, 5);
    let b = a.affine(2.0, 1.0);
    let dist = TransitionDistribution::uniform(64, 5);
    let config = FixedPointConfig::default();
    c.bench_function("deshape_pearson_64", |bench| {
        bench.iter(|| {
            deshape_pearson_distance(black_box(&a), black_box(&b), &dist, 0.99, DeshapeKind::FullyConnectedRandom, &config)
                .expect("distance")
        });
    });
}

criterion_group!(benches, bench_canonicalize, bench_pearson);
criterion_main!(benches);
