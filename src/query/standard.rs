//! Standard telemetry workload
//!
//! | Origin | Query                    | Training packets          |
//! |--------|--------------------------|---------------------------|
//! | 1      | TCP duplicate ACKs       | TCP, flags = ACK          |
//! | 2      | New TCP connections      | TCP, flags = SYN          |
//! | 3      | SSH brute force          | TCP, dPort 22, bytes/100  |
//! | 4      | Heavy hitter (bytes)     | TCP                       |
//! | 5      | Super spreader           | all                       |
//! | 6      | Port scan                | all                       |
//! | 7      | UDP DDoS                 | UDP                       |
//! | 11     | UDP traffic asymmetry    | UDP (111, 112, 113)       |

use super::builder::{PacketStream, Query};
use super::stage::Combinator;
use super::workload::{QueryGroup, Workload};
use crate::error::Result;
use crate::packet::{Field, PacketPredicate, PacketTransform};
use crate::relation::MapValue;

const TCP: u8 = 6;
const UDP: u8 = 17;
const FLAG_SYN: u8 = 2;
const FLAG_ACK: u8 = 16;
const SSH_PORT: u16 = 22;

/// Hosts receiving many duplicate ACKs
pub fn dup_acks() -> Result<Query> {
    let keys = [Field::DstIp, Field::SrcIp, Field::TcpAck];
    PacketStream::new(1)
        .map(&keys, MapValue::One)
        .reduce(&keys)
        .filter(99.99)
        .build()
}

/// Hosts receiving many new TCP connections
pub fn new_connections() -> Result<Query> {
    PacketStream::new(2)
        .map(&[Field::DstIp], MapValue::One)
        .reduce(&[Field::DstIp])
        .filter(99.9)
        .build()
}

/// Hosts contacted by many sources with same-sized SSH packets
pub fn ssh_brute_force() -> Result<Query> {
    let flow = [Field::DstIp, Field::SrcIp, Field::NBytes];
    let per_size = [Field::DstIp, Field::NBytes];
    PacketStream::new(3)
        .map(&flow, MapValue::One)
        .distinct(&flow)
        .map(&per_size, MapValue::One)
        .reduce(&per_size)
        .filter(99.9)
        .build()
}

/// Host pairs exchanging the most bytes
pub fn heavy_hitter() -> Result<Query> {
    let pair = [Field::DstIp, Field::SrcIp];
    PacketStream::new(4)
        .map(&[Field::DstIp, Field::SrcIp, Field::NBytes], MapValue::One)
        .map(&pair, MapValue::Field(Field::NBytes))
        .reduce(&pair)
        .filter(99.9)
        .build()
}

/// Sources contacting many distinct destinations
pub fn super_spreader() -> Result<Query> {
    let pair = [Field::DstIp, Field::SrcIp];
    PacketStream::new(5)
        .refine_on(Field::SrcIp)
        .map(&pair, MapValue::One)
        .distinct(&pair)
        .map(&[Field::SrcIp], MapValue::One)
        .reduce(&[Field::SrcIp])
        .filter(99.99)
        .build()
}

/// Sources touching many distinct destination ports
pub fn port_scan() -> Result<Query> {
    let scanned = [Field::SrcIp, Field::DstPort];
    PacketStream::new(6)
        .map(&scanned, MapValue::One)
        .distinct(&scanned)
        .map(&[Field::SrcIp], MapValue::One)
        .reduce(&[Field::SrcIp])
        .filter(99.99)
        .build()
}

/// Destinations receiving UDP from many distinct sources
pub fn udp_ddos() -> Result<Query> {
    let pair = [Field::DstIp, Field::SrcIp];
    PacketStream::new(7)
        .map(&pair, MapValue::One)
        .distinct(&pair)
        .map(&[Field::DstIp], MapValue::One)
        .reduce(&[Field::DstIp])
        .filter(99.9)
        .build()
}

/// Forward branch of the asymmetry query: UDP packets per (dst, sPort)
pub fn udp_forward() -> Result<Query> {
    let keys = [Field::DstIp, Field::SrcPort];
    PacketStream::new(111)
        .map(&keys, MapValue::One)
        .reduce(&keys)
        .filter(99.9)
        .build()
}

/// Reverse branch of the asymmetry query: UDP packets per (src, dPort)
pub fn udp_reverse() -> Result<Query> {
    let keys = [Field::SrcIp, Field::DstPort];
    PacketStream::new(112)
        .refine_on(Field::SrcIp)
        .map(&keys, MapValue::One)
        .reduce(&keys)
        .build()
}

/// Hosts receiving far more UDP than they answer
///
/// Forward rows must sit strictly above the forward query's threshold.
pub fn udp_asymmetry() -> Result<Query> {
    PacketStream::join(113, 111, 112, Combinator::Diff)
        .above_left_threshold()
        .filter(99.9)
        .build()
}

/// The standard workload with its partition plans
pub fn standard_workload() -> Result<Workload> {
    let groups = vec![
        QueryGroup::new(1)
            .with_predicate(PacketPredicate::Proto(TCP))
            .with_predicate(PacketPredicate::TcpFlags(FLAG_ACK))
            .with_query(dup_acks()?, &[0, 2, 3])?,
        QueryGroup::new(2)
            .with_predicate(PacketPredicate::Proto(TCP))
            .with_predicate(PacketPredicate::TcpFlags(FLAG_SYN))
            .with_query(new_connections()?, &[0, 2, 3])?,
        QueryGroup::new(3)
            .with_predicate(PacketPredicate::Proto(TCP))
            .with_predicate(PacketPredicate::DstPort(SSH_PORT))
            .with_transform(PacketTransform::RoundBytesUp(100))
            .with_query(ssh_brute_force()?, &[0, 2, 4, 5])?,
        QueryGroup::new(4)
            .with_predicate(PacketPredicate::Proto(TCP))
            .with_query(heavy_hitter()?, &[0, 3, 4])?,
        QueryGroup::new(5).with_query(super_spreader()?, &[0, 2, 4, 5])?,
        QueryGroup::new(6).with_query(port_scan()?, &[0, 2, 4, 5])?,
        QueryGroup::new(7)
            .with_predicate(PacketPredicate::Proto(UDP))
            .with_query(udp_ddos()?, &[0, 2, 4, 5])?,
        QueryGroup::new(11)
            .with_predicate(PacketPredicate::Proto(UDP))
            .with_query(udp_forward()?, &[0, 2, 3])?
            .with_query(udp_reverse()?, &[0, 2])?
            .with_query(udp_asymmetry()?, &[2])?
            .with_baseline(111, 113)
            .with_baseline(112, 113),
    ];
    Workload::new(groups)
}
