//! Backend comparison benchmarks
//!
//! Run with: cargo bench -p duplex-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use duplex_config::BackendKind;
use duplex_engine::{attend, AttentionShape, Runtime};
use duplex_tensor::FloatTensor;

fn random(rng: &mut StdRng, len: usize) -> FloatTensor {
    FloatTensor::from_vec((0..len).map(|_| rng.gen_range(-1.0..1.0)).collect())
}

fn runtimes() -> Vec<Runtime> {
    [BackendKind::Cpu, BackendKind::Accelerator, BackendKind::Verify]
        .into_iter()
        .map(|kind| Runtime::simulated(1 << 30, kind).unwrap())
        .collect()
}

fn benchmark_matmul(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_matmul");
    let mut rng = StdRng::seed_from_u64(1);

    for dim in [256, 1024].iter() {
        let weights = FloatTensor::from_vec_immutable(random(&mut rng, dim * dim).into_vec());
        let input = random(&mut rng, *dim);

        for runtime in runtimes() {
            let backend = runtime.backend();
            group.bench_with_input(BenchmarkId::new(backend.name(), dim), dim, |b, &dim| {
                let mut out = FloatTensor::zeros(dim);
                b.iter(|| {
                    backend.matmul(&weights, &input, &mut out, dim, dim).unwrap();
                    black_box(out.get(0))
                })
            });
        }
    }

    group.finish();
}

fn benchmark_attention(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_attention");
    let mut rng = StdRng::seed_from_u64(2);
    let shape = AttentionShape {
        num_heads: 8,
        num_kv_heads: 2,
        head_size: 64,
        context_length: 512,
    };
    let query = random(&mut rng, shape.dim());
    let keys = random(&mut rng, shape.cache_len());
    let values = random(&mut rng, shape.cache_len());

    for position in [63, 511].iter() {
        for runtime in runtimes() {
            let backend = runtime.backend();
            group.bench_with_input(
                BenchmarkId::new(backend.name(), position + 1),
                position,
                |b, &position| {
                    let mut att = FloatTensor::zeros(shape.scores_len());
                    let mut out = FloatTensor::zeros(shape.dim());
                    b.iter(|| {
                        attend(backend, &shape, position, &query, &keys, &values, &mut att, &mut out)
                            .unwrap();
                        black_box(out.get(0))
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_matmul, benchmark_attention);
criterion_main!(benches);
