use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use statbucket::config::{MetricConfig, MetricKind};
use statbucket::dimension::{DimensionKey, FieldValue};
use statbucket::health::HealthMetrics;
use statbucket::producer::MetricProducer;
use statbucket::sample::Sample;

const NS: u64 = 1_000_000_000;
const BUCKET_NS: u64 = 60 * NS;

fn pulled_batch(timestamp_ns: u64, base: i64) -> Vec<Sample> {
    (0..128i64)
        .map(|i| {
            Sample::new(
                DimensionKey::new([(1, FieldValue::Int(4_000 + i)), (2, FieldValue::from("wifi"))]),
                timestamp_ns,
                vec![FieldValue::Int(4_000 + i), FieldValue::Int(base + i * 3)],
            )
        })
        .collect()
}

fn producer(kind: MetricKind) -> MetricProducer {
    let mut metric = MetricConfig::new(1, kind);
    match kind {
        MetricKind::Value => metric.value_field = Some(2),
        MetricKind::Gauge => metric.gauge_fields = Some(vec![2]),
    }
    let health = Arc::new(HealthMetrics::new().expect("metrics"));
    MetricProducer::build(&metric, 0, None, health).expect("valid producer")
}

fn bench_on_data_pulled(c: &mut Criterion) {
    for (name, kind) in [("value", MetricKind::Value), ("gauge", MetricKind::Gauge)] {
        let p = producer(kind);
        let mut tick = 0u64;

        c.bench_function(&format!("on_data_pulled/{name}_128_keys"), |b| {
            b.iter(|| {
                tick += 1;
                let batch = pulled_batch(tick * NS, tick as i64 * 10);
                p.on_data_pulled(black_box(batch));
            })
        });
    }
}

fn bench_dump(c: &mut Criterion) {
    c.bench_function("on_dump_report/value_128_keys_10_buckets", |b| {
        b.iter_with_setup(
            || {
                let p = producer(MetricKind::Value);
                for bucket in 0..=10u64 {
                    p.on_data_pulled(pulled_batch(bucket * BUCKET_NS + NS, bucket as i64 * 100));
                }
                p
            },
            |p| black_box(p.on_dump_report(11 * BUCKET_NS).expect("dump")),
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_on_data_pulled(c);
    bench_dump(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
