//! Integration tests for threshold calibration across refinement levels

use proptest::prelude::*;
use std::net::Ipv4Addr;

use refinement_cost::calibration::{PercentileEstimator, PercentileRule, ThresholdCalibrator};
use refinement_cost::engine::{CheckpointNamespace, CheckpointStore, MemoryCheckpointStore};
use refinement_cost::packet::{Field, PacketPredicate};
use refinement_cost::query::standard::{new_connections, udp_ddos};
use refinement_cost::query::{standard_workload, PacketStream, QueryGroup};
use refinement_cost::relation::MapValue;
use refinement_cost::{PacketRecord, RefinementHierarchy};

fn syn(ts: u32, src: Ipv4Addr, dst: Ipv4Addr) -> PacketRecord {
    PacketRecord {
        ts,
        src_ip: src,
        src_port: 40000,
        dst_ip: dst,
        dst_port: 443,
        n_bytes: 60,
        proto: 6,
        tcp_seq: 0,
        tcp_ack: 0,
        tcp_flags: 2,
    }
}

/// SYN traffic spread over a handful of /16 and /24 networks
fn syn_traffic() -> Vec<PacketRecord> {
    let mut packets = Vec::new();
    let targets: [([u8; 4], usize); 6] = [
        ([10, 1, 1, 1], 120),
        ([10, 1, 1, 2], 80),
        ([10, 1, 2, 1], 60),
        ([10, 2, 1, 1], 30),
        ([172, 16, 0, 1], 10),
        ([192, 168, 5, 5], 3),
    ];
    for (dst, n) in targets {
        for i in 0..n {
            let src = Ipv4Addr::new(100, 64, (i / 250) as u8, (i % 250) as u8);
            packets.push(syn(1, src, Ipv4Addr::from(dst)));
        }
    }
    packets
}

fn syn_group() -> QueryGroup {
    QueryGroup::new(2)
        .with_predicate(PacketPredicate::Proto(6))
        .with_predicate(PacketPredicate::TcpFlags(2))
        .with_query(new_connections().unwrap(), &[0, 2, 3])
        .unwrap()
}

#[test]
fn test_admitted_keys_shrink_as_levels_coarsen() {
    let hierarchy = RefinementHierarchy::new(32, 8).unwrap();
    let calibrator = ThresholdCalibrator::new(hierarchy.clone()).with_percentiles(vec![PercentileRule {
        query: 2,
        level: None,
        percentile: 50.0,
    }]);
    let group = syn_group();
    let source = group.training_relation(&syn_traffic());
    let store = MemoryCheckpointStore::new();

    let ctx = calibrator
        .calibrate_group(&group, &source, &store, CheckpointNamespace::new("run"))
        .unwrap();

    let levels = hierarchy.levels();
    for pair in levels.windows(2) {
        let (coarse, fine) = (pair[0], pair[1]);
        let coarse_out = store.read(ctx.filter_checkpoint(2, coarse).unwrap()).unwrap();
        let fine_out = store.read(ctx.filter_checkpoint(2, fine).unwrap()).unwrap();

        let allowed = fine_out.rekey(coarse).key_set();
        assert!(coarse_out.key_set().is_subset(&allowed), "level {} vs {}", coarse, fine);
        assert!(coarse_out.len() <= fine_out.len());
    }

    // Finest level: median of [3, 10, 30, 60, 80, 120]
    assert_eq!(ctx.thresholds().get(2, 32).unwrap().value(), 45);
}

#[test]
fn test_exact_and_digest_land_in_the_top_bucket() {
    let hierarchy = RefinementHierarchy::new(32, 16).unwrap();
    let group = syn_group();
    let source = group.training_relation(&syn_traffic());

    let exact = ThresholdCalibrator::new(hierarchy.clone())
        .calibrate_group(&group, &source, &MemoryCheckpointStore::new(), CheckpointNamespace::new("a"))
        .unwrap();
    let digest = ThresholdCalibrator::new(hierarchy)
        .with_estimator(PercentileEstimator::TDigest { max_size: 100 })
        .calibrate_group(&group, &source, &MemoryCheckpointStore::new(), CheckpointNamespace::new("b"))
        .unwrap();

    // 99.9th percentile of [3, 10, 30, 60, 80, 120] interpolates to 119.8
    assert_eq!(exact.thresholds().get(2, 32).unwrap().value(), 119);
    let approx = digest.thresholds().get(2, 32).unwrap().value();
    assert!((80..=120).contains(&approx), "digest threshold {}", approx);
}

#[test]
fn test_join_workload_calibrates_branches_and_join() {
    let workload = standard_workload().unwrap();
    let group = workload.group(11).unwrap();
    let hierarchy = RefinementHierarchy::new(32, 8).unwrap();

    let mut packets = Vec::new();
    for i in 0..50u8 {
        let mut p = syn(1, Ipv4Addr::new(10, 0, 0, i), Ipv4Addr::new(172, 16, 0, 1));
        p.proto = 17;
        p.src_port = 53;
        p.dst_port = 5000;
        packets.push(p);
    }
    let source = group.training_relation(&packets);
    let ctx = ThresholdCalibrator::new(hierarchy.clone())
        .calibrate_group(group, &source, &MemoryCheckpointStore::new(), CheckpointNamespace::new("m1"))
        .unwrap();

    let table = ctx.thresholds();
    for &level in hierarchy.levels() {
        assert!(table.get(111, level).is_some());
        assert!(table.get(113, level).is_some());
        assert!(table.get(112, level).is_none());
    }
}

/// UDP packets with explicit ports, all at ts 1
fn udp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> PacketRecord {
    let mut p = syn(1, Ipv4Addr::from(src), Ipv4Addr::from(dst));
    p.proto = 17;
    p.tcp_flags = 0;
    p.src_port = sport;
    p.dst_port = dport;
    p
}

#[test]
fn test_join_threshold_reads_strict_forward_rows() {
    let workload = standard_workload().unwrap();
    let group = workload.group(11).unwrap();
    let hierarchy = RefinementHierarchy::from_levels(&[32, 8]).unwrap();

    let mut packets = Vec::new();
    for i in 0..50u8 {
        packets.push(udp([10, 0, 0, i], 53, [172, 16, 0, 1], 5000));
    }
    for i in 0..30u8 {
        packets.push(udp([10, 0, 1, i], 53, [172, 99, 0, 1], 5000));
    }
    for i in 0..25u8 {
        packets.push(udp([10, 0, 2, i], 53, [192, 168, 0, 1], 5000));
    }
    packets.extend((0..10).map(|_| udp([172, 16, 0, 1], 7000, [10, 9, 0, 1], 53)));
    packets.extend((0..20).map(|_| udp([192, 168, 0, 1], 7000, [10, 9, 0, 2], 53)));

    let source = group.training_relation(&packets);
    let store = MemoryCheckpointStore::new();
    let ctx = ThresholdCalibrator::new(hierarchy)
        .calibrate_group(group, &source, &store, CheckpointNamespace::new("m1"))
        .unwrap();
    let table = ctx.thresholds();

    // 111 at /32: 99.9th percentile of [10, 20, 25, 30, 50] is 49.92
    assert_eq!(table.get(111, 32).unwrap().value(), 49);
    // Only 172.16.0.1 clears it; its 10 replies count double
    assert_eq!(table.get(113, 32).unwrap().value(), 30);

    // 111 at /8: 172/8 survives with 80, so no forward row is above 80
    assert_eq!(table.get(111, 8).unwrap().value(), 80);
    assert_eq!(table.get(113, 8).unwrap().value(), 2);
    assert!(store.read(ctx.filter_checkpoint(113, 8).unwrap()).unwrap().is_empty());
}

#[test]
fn test_custom_query_without_filter_is_not_calibrated() {
    let query = PacketStream::new(40)
        .map(&[Field::DstIp], MapValue::One)
        .reduce(&[Field::DstIp])
        .build()
        .unwrap();
    let group = QueryGroup::new(40).with_query(query, &[0, 2]).unwrap();
    let source = group.training_relation(&syn_traffic());
    let ctx = ThresholdCalibrator::new(RefinementHierarchy::new(32, 16).unwrap())
        .calibrate_group(&group, &source, &MemoryCheckpointStore::new(), CheckpointNamespace::new("x"))
        .unwrap();
    assert!(ctx.thresholds().is_empty());
}

fn arb_packet() -> impl Strategy<Value = PacketRecord> {
    (0u8..4, 0u8..8, 0u8..4, 0u8..16).prop_map(|(a, b, c, d)| PacketRecord {
        ts: 1,
        src_ip: Ipv4Addr::new(10, a, b, d),
        src_port: 1234,
        dst_ip: Ipv4Addr::new(172, 16, c, d),
        dst_port: 53,
        n_bytes: 100,
        proto: 17,
        tcp_seq: 0,
        tcp_ack: 0,
        tcp_flags: 0,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_thresholds_never_below_floor(packets in prop::collection::vec(arb_packet(), 0..200)) {
        let hierarchy = RefinementHierarchy::new(32, 8).unwrap();
        let group = QueryGroup::new(7)
            .with_predicate(PacketPredicate::Proto(17))
            .with_query(udp_ddos().unwrap(), &[0, 2, 4, 5])
            .unwrap();
        let source = group.training_relation(&packets);
        let ctx = ThresholdCalibrator::new(hierarchy.clone())
            .calibrate_group(&group, &source, &MemoryCheckpointStore::new(), CheckpointNamespace::new("p"))
            .unwrap();

        for &level in hierarchy.levels() {
            let threshold = ctx.thresholds().get(7, level);
            prop_assert!(threshold.is_some());
            prop_assert!(threshold.unwrap().value() >= 2);
        }
    }
}
