//! Benchmarks for partition planning, request encoding and partition execution

use brokermr::computation::{DynComputation, SumOfSquares};
use brokermr::coordinator::{plan_partitions, PartitionStrategy};
use brokermr::protocol::{decode_request, encode_request, PartitionRequest};
use brokermr::source::{ArithmeticSource, ArithmeticSpec, Partition, SourceFactory, SourceSpec};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::Value;
use std::hint::black_box;
use std::time::Duration;
use uuid::Uuid;

fn bench_plan_partitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_partitions");
    group.warm_up_time(Duration::from_secs(1));

    for workers in [4u32, 64, 1024].iter() {
        group.bench_with_input(BenchmarkId::new("floor_plus_one", workers), workers, |b, &w| {
            b.iter(|| plan_partitions(black_box(10_000_000), w, PartitionStrategy::FloorPlusOne))
        });
    }
    group.finish();
}

fn bench_request_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_codec");
    group.warm_up_time(Duration::from_secs(1));

    let spec = SourceSpec::Arithmetic(ArithmeticSpec::integers(1_000_000));
    let derived = SourceFactory::derived(spec)
        .slice(0, 250_000)
        .unwrap();
    let inline = SourceFactory::inline((0..100_000i64).map(Value::from))
        .slice(0, 25_000)
        .unwrap();

    for (name, factory) in [("derived", derived), ("inline", inline)] {
        let request = PartitionRequest {
            run_id: Uuid::new_v4(),
            sequence_index: 0,
            computation: "sum_of_squares".to_string(),
            factory,
        };
        let payload = encode_request(&request).unwrap();

        group.bench_function(BenchmarkId::new("encode", name), |b| {
            b.iter(|| encode_request(black_box(&request)))
        });
        group.bench_function(BenchmarkId::new("decode", name), |b| {
            b.iter(|| decode_request(black_box(&payload)))
        });
    }
    group.finish();
}

fn bench_run_partition(c: &mut Criterion) {
    let source = ArithmeticSource::new(ArithmeticSpec::integers(100_000)).unwrap();
    let computation = SumOfSquares::default();

    c.bench_function("sum_of_squares_100k", |b| {
        b.iter(|| {
            let partition = black_box(Partition::new(0, 100_000));
            DynComputation::run_partition(&computation, &source, partition)
        })
    });
}

criterion_group!(
    benches,
    bench_plan_partitions,
    bench_request_codec,
    bench_run_partition
);
criterion_main!(benches);
