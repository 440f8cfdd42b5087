use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use lockstep::partition::assign_indices;
use lockstep::{HostTensor, ReduceOp, TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn bench_partition(c: &mut Criterion) {
    c.bench_function("assign_indices/1m_rows_8_ranks", |b| {
        b.iter(|| assign_indices(black_box(1_000_003), black_box(8)))
    });
}

fn bench_sum_rows(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let data: Vec<f32> = (0..1024 * 256).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let batch = HostTensor::from_vec(data, &[1024, 256]).unwrap();
    c.bench_function("sum_rows/1024x256_f32", |b| {
        b.iter(|| batch.sum_rows().unwrap())
    });
}

fn bench_combine(c: &mut Criterion) {
    let contribution = TensorData::F32(vec![2.0; 1 << 18]);
    let base = TensorData::F32(vec![1.0; 1 << 18]);
    c.bench_function("combine_assign/sum_256k_f32", |b| {
        b.iter_batched(
            || base.clone(),
            |mut acc| {
                acc.combine_assign(&contribution, ReduceOp::Sum).unwrap();
                acc
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_partition, bench_sum_rows, bench_combine);
criterion_main!(benches);
