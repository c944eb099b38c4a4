//! Calibration and Estimation Benchmarks
//!
//! Measures percentile estimation, threshold calibration of one origin and
//! a full minute of estimation across the standard workload.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use refinement_cost::calibration::{PercentileEstimator, ThresholdCalibrator};
use refinement_cost::engine::{CheckpointNamespace, MemoryCheckpointStore};
use refinement_cost::query::standard_workload;
use refinement_cost::relation::ParallelConfig;
use refinement_cost::{CostEstimator, PacketRecord, RefinementHierarchy};
use std::hint::black_box;
use std::net::Ipv4Addr;

// =============================================================================
// Test Data Generators
// =============================================================================

/// Synthetic UDP and TCP traffic with skewed destinations
fn create_traffic(count: usize) -> Vec<PacketRecord> {
    (0..count)
        .map(|i| {
            let hot = i % 7 == 0;
            let dst = if hot {
                Ipv4Addr::new(172, 16, 0, 1)
            } else {
                Ipv4Addr::new(172, (i % 31) as u8, (i % 251) as u8, (i % 13) as u8)
            };
            PacketRecord {
                ts: 1,
                src_ip: Ipv4Addr::new(10, (i / 65_536) as u8, (i / 256) as u8, i as u8),
                src_port: (1024 + i % 50_000) as u16,
                dst_ip: dst,
                dst_port: if i % 3 == 0 { 22 } else { 53 },
                n_bytes: 60 + (i % 1400) as u64,
                proto: if i % 2 == 0 { 6 } else { 17 },
                tcp_seq: i as u64,
                tcp_ack: (i / 4) as u64,
                tcp_flags: if i % 5 == 0 { 2 } else { 16 },
            }
        })
        .collect()
}

fn create_values(count: usize) -> Vec<f64> {
    (0..count).map(|i| ((i * 7919) % 10_007) as f64).collect()
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_percentile_estimators(c: &mut Criterion) {
    let mut group = c.benchmark_group("percentile");

    for size in [1_000, 100_000] {
        let values = create_values(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("exact", size), &values, |b, values| {
            b.iter(|| black_box(PercentileEstimator::Exact.estimate(values, 99.9)))
        });
        group.bench_with_input(BenchmarkId::new("tdigest", size), &values, |b, values| {
            let estimator = PercentileEstimator::TDigest { max_size: 100 };
            b.iter(|| black_box(estimator.estimate(values, 99.9)))
        });
    }

    group.finish();
}

fn bench_calibrate_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("calibrate_group");
    let workload = standard_workload().expect("standard workload");
    let Some(udp) = workload.group(7) else {
        return;
    };

    for size in [10_000, 50_000] {
        let source = udp.training_relation(&create_traffic(size));
        group.throughput(Throughput::Elements(size as u64));

        for (name, parallel) in [
            ("sequential", ParallelConfig::sequential()),
            ("parallel", ParallelConfig::default()),
        ] {
            group.bench_with_input(BenchmarkId::new(name, size), &source, |b, source| {
                let calibrator =
                    ThresholdCalibrator::new(RefinementHierarchy::new(32, 4).expect("hierarchy"))
                        .with_parallel(parallel);
                b.iter(|| {
                    let store = MemoryCheckpointStore::new();
                    black_box(
                        calibrator
                            .calibrate_group(udp, source, &store, CheckpointNamespace::new("bench"))
                            .expect("calibration"),
                    )
                })
            });
        }
    }

    group.finish();
}

fn bench_estimate_minute(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate_minute");
    group.sample_size(10);

    let packets = create_traffic(20_000);
    group.throughput(Throughput::Elements(packets.len() as u64));

    for step in [8u8, 4] {
        group.bench_with_input(BenchmarkId::new("step", step), &packets, |b, packets| {
            let estimator = CostEstimator::new(
                standard_workload().expect("standard workload"),
                RefinementHierarchy::new(32, step).expect("hierarchy"),
            )
            .expect("estimator");
            b.iter(|| black_box(estimator.run_minute(1, packets).expect("minute")))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_percentile_estimators,
    bench_calibrate_group,
    bench_estimate_minute,
);
criterion_main!(benches);
