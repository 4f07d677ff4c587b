//! Benchmarks for the local similarity kernel and the cross-probability
//! affinity it is compared against.

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use daseg_core::SimType;
use daseg_uda::{CrossProbability, LocalSimilarity, NegativeAffinity, Window};

fn features(channels: usize, side: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (2, channels, side, side), &Device::Cpu)
        .expect("random features")
}

fn benchmark_similarity(c: &mut Criterion) {
    let window = Window::new(3, 1);
    let cosine = LocalSimilarity::new(window, SimType::Cosine, 1.0);
    let gaussian = LocalSimilarity::new(window, SimType::Gaussian, 1.0);
    let dilated = LocalSimilarity::new(Window::new(3, 2), SimType::Cosine, 1.0);

    let small = features(64, 32);
    let wide = features(256, 32);

    c.bench_function("cosine_3x3_c64_32x32", |b| {
        b.iter(|| cosine.forward(black_box(&small)))
    });

    c.bench_function("gaussian_3x3_c64_32x32", |b| {
        b.iter(|| gaussian.forward(black_box(&small)))
    });

    c.bench_function("cosine_3x3_d2_c64_32x32", |b| {
        b.iter(|| dilated.forward(black_box(&small)))
    });

    c.bench_function("cosine_3x3_c256_32x32", |b| {
        b.iter(|| cosine.forward(black_box(&wide)))
    });
}

fn benchmark_affinity(c: &mut Criterion) {
    let cross = CrossProbability::new(Window::new(3, 1));
    let logits = features(19, 64);

    c.bench_function("affinity_off_diagonal_19x64x64", |b| {
        b.iter(|| cross.affinity(black_box(&logits), NegativeAffinity::OffDiagonal))
    });

    c.bench_function("affinity_complement_19x64x64", |b| {
        b.iter(|| cross.affinity(black_box(&logits), NegativeAffinity::Complement))
    });
}

criterion_group!(benches, benchmark_similarity, benchmark_affinity);
criterion_main!(benches);
