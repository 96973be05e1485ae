//! Performance benchmarks for feedsync-engine

use chrono::{DateTime, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use feedsync_engine::{
    CacheSnapshot, EntityKey, EntityStatus, FeedBatch, FeedState, FeedVersion, Keyed, Reconciler,
    StagingBatch,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Device {
    id: String,
    name: String,
    group: u32,
}

impl Keyed for Device {
    fn key(&self) -> EntityKey {
        self.id.clone()
    }
}

fn devices(count: usize, name: &str) -> Vec<Device> {
    (0..count)
        .map(|i| Device {
            id: format!("device_{:06}", i),
            name: format!("{} {}", name, i),
            group: (i % 16) as u32,
        })
        .collect()
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn bench_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("feed");

    group.bench_function("apply_and_drain_500", |b| {
        let mut state: FeedState<Device> =
            FeedState::new("DeviceFeed", Duration::from_secs(5), 500, None).unwrap();
        let mut version = 0i64;

        b.iter(|| {
            version += 500;
            let batch = FeedBatch::new(devices(500, "Truck"), FeedVersion::new(version));
            state.apply_batch(black_box(batch), at(version)).unwrap();
            let drained = state.drain_results();
            state.mark_committed(FeedVersion::new(version)).unwrap();
            drained
        })
    });

    group.finish();
}

fn bench_staging(c: &mut Criterion) {
    let mut group = c.benchmark_group("staging");

    for size in [100, 1000, 10000].iter() {
        let records = devices(*size, "Truck");
        group.bench_with_input(BenchmarkId::new("from_records", size), &records, |b, records| {
            b.iter(|| StagingBatch::from_records(black_box(records), at(1)))
        });
    }

    group.finish();
}

fn bench_reconciliation(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconciliation");

    for size in [100, 1000, 10000].iter() {
        // Half the population is persisted, a tenth of it no longer exists at
        // the source, and every record changed since the last propagation.
        let mut persisted: HashMap<EntityKey, EntityStatus> = HashMap::new();
        for i in 0..*size / 2 {
            persisted.insert(format!("device_{:06}", i), EntityStatus::Active);
        }
        for i in 0..*size / 10 {
            persisted.insert(format!("gone_{:06}", i), EntityStatus::Active);
        }

        let mut snapshot = CacheSnapshot::new();
        snapshot.apply_refresh(devices(*size, "Truck"), at(1));

        group.bench_with_input(BenchmarkId::new("refresh", size), size, |b, _| {
            b.iter(|| {
                Reconciler::new("id", black_box(&persisted)).reconcile(black_box(&snapshot), at(2))
            })
        });

        let mut propagated = snapshot.clone();
        propagated.mark_propagated(at(2));
        propagated.apply_incremental(devices(*size / 10, "Van"), at(3));

        group.bench_with_input(BenchmarkId::new("incremental", size), size, |b, _| {
            b.iter(|| {
                Reconciler::new("id", black_box(&persisted)).reconcile(black_box(&propagated), at(4))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_feed, bench_staging, bench_reconciliation);
criterion_main!(benches);
