use criterion::{Criterion, criterion_group, criterion_main};
use meshtune::distributed::tp_plan::ShardSpec;
use meshtune::tensor::DType;
use meshtune::tensor::ops::arange;
use std::hint::black_box;

fn benchmark_shard(c: &mut Criterion) {
    let mut group = c.benchmark_group("shard");

    // A 1024x1024 weight split across 4 tensor-parallel ranks.
    let full = arange(&[1024, 1024], DType::BF16);

    // Axis 0 shards are one contiguous run each.
    let rows = ShardSpec::split(0, 4, 1);
    group.bench_function("slice_rows_bf16_1024", |b| {
        b.iter(|| black_box(rows.slice(&full).unwrap()))
    });

    // Axis 1 shards copy 1024 short runs.
    let cols = ShardSpec::split(1, 4, 1);
    group.bench_function("slice_cols_bf16_1024", |b| {
        b.iter(|| black_box(cols.slice(&full).unwrap()))
    });

    let shards = cols.slice_all(&full).unwrap();
    group.bench_function("reconstruct_cols_bf16_1024", |b| {
        b.iter(|| black_box(cols.reconstruct(&shards).unwrap()))
    });

    group.bench_function("cast_f32_to_bf16_1024", |b| {
        let f32_full = arange(&[1024, 1024], DType::F32);
        b.iter(|| black_box(f32_full.to_dtype(DType::BF16)))
    });

    group.finish();
}

criterion_group!(benches, benchmark_shard);
criterion_main!(benches);
