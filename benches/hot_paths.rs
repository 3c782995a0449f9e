use criterion::{black_box, criterion_group, criterion_main, Criterion};

use traceloom::record::{Record, RecordKind, ServiceMetric};
use traceloom::remote::StreamTypeRegistryBuilder;
use traceloom::stream::selector::{fnv1a_64, hash_select};

fn metric(calls: i64) -> Record {
    Record::Service(ServiceMetric {
        id: ServiceMetric::record_id("checkout", 202401010000),
        time_bucket: 202401010000,
        service: "checkout".to_string(),
        calls,
        error_calls: calls / 4,
        duration_sum: calls * 12,
        duration_max: 250,
        duration_min: 3,
    })
}

fn bench_selector(c: &mut Criterion) {
    c.bench_function("fnv1a_64", |b| {
        b.iter(|| fnv1a_64(black_box("202401010000_checkout_checkout-1")));
    });

    c.bench_function("hash_select", |b| {
        b.iter(|| hash_select(black_box(16), black_box("202401010000_checkout")));
    });
}

fn bench_merge(c: &mut Criterion) {
    let incoming = metric(1);

    c.bench_function("service_metric_merge", |b| {
        b.iter_batched(
            || metric(100),
            |mut acc| {
                acc.merge(black_box(&incoming)).unwrap();
                acc
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_envelope(c: &mut Criterion) {
    let mut builder = StreamTypeRegistryBuilder::default();
    for kind in RecordKind::ALL {
        builder.register(*kind);
    }
    let types = builder.finalize();
    let record = metric(42);
    let envelope = record.to_envelope(&types).unwrap();

    c.bench_function("envelope_encode", |b| {
        b.iter(|| black_box(&record).to_envelope(&types).unwrap());
    });

    c.bench_function("envelope_decode", |b| {
        b.iter(|| Record::from_envelope(black_box(&envelope), &types).unwrap());
    });
}

criterion_group!(benches, bench_selector, bench_merge, bench_envelope);
criterion_main!(benches);
