//! Benchmarks for identity resolution.

use actorflow::registry::{HashRegistry, Registry, UnitIdentity};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn resolve_benchmark(c: &mut Criterion) {
    let registry = HashRegistry::new();
    let salted = HashRegistry::with_salt("tenant-7");

    c.bench_function("resolve", |b| {
        b.iter(|| registry.resolve(black_box("pipeline"), black_box("wf_42")))
    });

    c.bench_function("resolve_salted", |b| {
        b.iter(|| salted.resolve(black_box("pipeline"), black_box("wf_42")))
    });

    let mut group = c.benchmark_group("resolve_name_length");
    for len in [8usize, 64, 512] {
        let name = "n".repeat(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &name, |b, name| {
            b.iter(|| registry.resolve("pipeline", black_box(name)))
        });
    }
    group.finish();
}

fn parse_benchmark(c: &mut Criterion) {
    let raw = UnitIdentity::derive("pipeline", "wf_42", None).to_string();
    c.bench_function("parse", |b| b.iter(|| UnitIdentity::parse(black_box(&raw))));
}

criterion_group!(benches, resolve_benchmark, parse_benchmark);
criterion_main!(benches);
