//! Packet records and trace loading
//!
//! Traces are CSV files with one packet per line:
//!
//! ```text
//! ts,sIP,sPort,dIP,dPort,nBytes,proto,tcp.seq,tcp.ack,tcp.flags
//! ```
//!
//! TCP columns may be empty for non-TCP packets and are read as zero.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::Timestamp;

/// Timestamp assigned to every packet when a trace is collapsed into one window
pub const COLLAPSED_TIMESTAMP: Timestamp = 1;

/// Header field a query can key on or read values from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    /// `ipv4_srcIP`
    SrcIp,
    /// `sPort`
    SrcPort,
    /// `ipv4_dstIP`
    DstIp,
    /// `dPort`
    DstPort,
    /// `nBytes`
    NBytes,
    /// `proto`
    Proto,
    /// `tcp_seq`
    TcpSeq,
    /// `tcp_ack`
    TcpAck,
    /// `tcp_flags`
    TcpFlags,
}

impl Field {
    /// All packet fields in trace column order
    pub const ALL: [Field; 9] = [
        Field::SrcIp,
        Field::SrcPort,
        Field::DstIp,
        Field::DstPort,
        Field::NBytes,
        Field::Proto,
        Field::TcpSeq,
        Field::TcpAck,
        Field::TcpFlags,
    ];

    /// Whether the field is an IPv4 address (and can be prefix-refined)
    pub fn is_address(&self) -> bool {
        matches!(self, Field::SrcIp | Field::DstIp)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::SrcIp => "ipv4_srcIP",
            Field::SrcPort => "sPort",
            Field::DstIp => "ipv4_dstIP",
            Field::DstPort => "dPort",
            Field::NBytes => "nBytes",
            Field::Proto => "proto",
            Field::TcpSeq => "tcp_seq",
            Field::TcpAck => "tcp_ack",
            Field::TcpFlags => "tcp_flags",
        };
        f.write_str(name)
    }
}

/// One packet of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Capture timestamp (seconds)
    pub ts: Timestamp,
    /// Source address
    pub src_ip: Ipv4Addr,
    /// Source port
    pub src_port: u16,
    /// Destination address
    pub dst_ip: Ipv4Addr,
    /// Destination port
    pub dst_port: u16,
    /// Packet size in bytes
    pub n_bytes: u64,
    /// IP protocol number
    pub proto: u8,
    /// TCP sequence number
    pub tcp_seq: u64,
    /// TCP acknowledgement number
    pub tcp_ack: u64,
    /// TCP flag bits
    pub tcp_flags: u8,
}

impl PacketRecord {
    /// Read a header field as an unsigned integer
    pub fn field(&self, field: Field) -> u64 {
        match field {
            Field::SrcIp => u32::from(self.src_ip) as u64,
            Field::SrcPort => self.src_port as u64,
            Field::DstIp => u32::from(self.dst_ip) as u64,
            Field::DstPort => self.dst_port as u64,
            Field::NBytes => self.n_bytes,
            Field::Proto => self.proto as u64,
            Field::TcpSeq => self.tcp_seq,
            Field::TcpAck => self.tcp_ack,
            Field::TcpFlags => self.tcp_flags as u64,
        }
    }

    /// Parse one CSV trace line
    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        if cols.len() < 10 {
            return Err(format!("expected 10 columns, found {}", cols.len()));
        }

        // Some exports write fractional seconds
        let ts = cols[0]
            .parse::<f64>()
            .map_err(|e| format!("ts '{}': {}", cols[0], e))?;
        if !(0.0..=u32::MAX as f64).contains(&ts) {
            return Err(format!("ts '{}' out of range", cols[0]));
        }

        Ok(Self {
            ts: ts.trunc() as Timestamp,
            src_ip: parse_addr("sIP", cols[1])?,
            src_port: parse_num("sPort", cols[2])?,
            dst_ip: parse_addr("dIP", cols[3])?,
            dst_port: parse_num("dPort", cols[4])?,
            n_bytes: parse_num("nBytes", cols[5])?,
            proto: parse_num("proto", cols[6])?,
            tcp_seq: parse_num("tcp.seq", cols[7])?,
            tcp_ack: parse_num("tcp.ack", cols[8])?,
            tcp_flags: parse_num("tcp.flags", cols[9])?,
        })
    }
}

fn parse_addr(name: &str, raw: &str) -> std::result::Result<Ipv4Addr, String> {
    raw.parse::<Ipv4Addr>()
        .map_err(|e| format!("{} '{}': {}", name, raw, e))
}

fn parse_num<T>(name: &str, raw: &str) -> std::result::Result<T, String>
where
    T: std::str::FromStr + Default,
    T::Err: fmt::Display,
{
    if raw.is_empty() {
        return Ok(T::default());
    }
    raw.parse::<T>()
        .map_err(|e| format!("{} '{}': {}", name, raw, e))
}

/// Options applied while loading a trace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceOptions {
    /// Put every packet in a single window (`ts = 1`)
    #[serde(default)]
    pub collapse_timestamps: bool,
}

/// Load every packet of a CSV trace file
///
/// Blank lines, `#` comments and a leading header line are skipped.
pub fn load_trace(path: &Path, options: TraceOptions) -> Result<Vec<PacketRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut packets = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("ts") {
            continue;
        }
        let mut packet = PacketRecord::parse_line(trimmed).map_err(|message| Error::Trace {
            line: idx + 1,
            message,
        })?;
        if options.collapse_timestamps {
            packet.ts = COLLAPSED_TIMESTAMP;
        }
        packets.push(packet);
    }

    tracing::debug!(path = %path.display(), packets = packets.len(), "Loaded trace");
    Ok(packets)
}

/// Predicate selecting the training packets of a query group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketPredicate {
    /// `proto == n`
    Proto(u8),
    /// `tcp_flags == n`
    TcpFlags(u8),
    /// `dPort == n`
    DstPort(u16),
    /// `sPort == n`
    SrcPort(u16),
}

impl PacketPredicate {
    /// Evaluate against a packet
    pub fn matches(&self, packet: &PacketRecord) -> bool {
        match *self {
            PacketPredicate::Proto(p) => packet.proto == p,
            PacketPredicate::TcpFlags(f) => packet.tcp_flags == f,
            PacketPredicate::DstPort(p) => packet.dst_port == p,
            PacketPredicate::SrcPort(p) => packet.src_port == p,
        }
    }
}

/// Rewrite applied to training packets after selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketTransform {
    /// Round `nBytes` up to the next multiple of the given bucket size
    RoundBytesUp(u64),
}

impl PacketTransform {
    /// Apply to a packet
    pub fn apply(&self, packet: &mut PacketRecord) {
        match *self {
            PacketTransform::RoundBytesUp(bucket) if bucket > 0 => {
                packet.n_bytes = packet.n_bytes.div_ceil(bucket) * bucket;
            },
            PacketTransform::RoundBytesUp(_) => {},
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Shorthand packet constructor for tests across the crate
    pub(crate) fn packet(ts: Timestamp, src: [u8; 4], dst: [u8; 4], dport: u16, proto: u8) -> PacketRecord {
        PacketRecord {
            ts,
            src_ip: Ipv4Addr::from(src),
            src_port: 40000,
            dst_ip: Ipv4Addr::from(dst),
            dst_port: dport,
            n_bytes: 60,
            proto,
            tcp_seq: 0,
            tcp_ack: 0,
            tcp_flags: 0,
        }
    }

    #[test]
    fn test_parse_line() {
        let p = PacketRecord::parse_line("1453363261,10.0.0.1,5353,192.168.1.7,53,120,17,,,").unwrap();
        assert_eq!(p.ts, 1453363261);
        assert_eq!(p.src_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(p.dst_port, 53);
        assert_eq!(p.proto, 17);
        assert_eq!(p.tcp_flags, 0);
        assert_eq!(p.field(Field::NBytes), 120);
    }

    #[test]
    fn test_parse_line_errors() {
        assert!(PacketRecord::parse_line("1,10.0.0.1,5353").is_err());
        assert!(PacketRecord::parse_line("1,10.0.0.300,1,10.0.0.2,2,60,6,0,0,16").is_err());
        assert!(PacketRecord::parse_line("x,10.0.0.1,1,10.0.0.2,2,60,6,0,0,16").is_err());
    }

    #[test]
    fn test_load_trace_collapses_timestamps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ts,sIP,sPort,dIP,dPort,nBytes,proto,tcp.seq,tcp.ack,tcp.flags").unwrap();
        writeln!(file, "100.5,10.0.0.1,1000,10.0.0.2,22,60,6,1,2,16").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "101,10.0.0.3,1001,10.0.0.2,22,61,6,1,2,2").unwrap();

        let packets = load_trace(
            file.path(),
            TraceOptions {
                collapse_timestamps: true,
            },
        )
        .unwrap();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.ts == COLLAPSED_TIMESTAMP));
    }

    #[test]
    fn test_load_trace_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1,10.0.0.1,1000,10.0.0.2,22,60,6,1,2,16").unwrap();
        writeln!(file, "1,10.0.0.1,1000").unwrap();

        let err = load_trace(file.path(), TraceOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Trace { line: 2, .. }));
    }

    #[test]
    fn test_predicates_and_rounding() {
        let mut p = packet(1, [10, 0, 0, 1], [10, 0, 0, 2], 22, 6);
        assert!(PacketPredicate::Proto(6).matches(&p));
        assert!(PacketPredicate::DstPort(22).matches(&p));
        assert!(!PacketPredicate::TcpFlags(16).matches(&p));

        PacketTransform::RoundBytesUp(100).apply(&mut p);
        assert_eq!(p.n_bytes, 100);
        p.n_bytes = 200;
        PacketTransform::RoundBytesUp(100).apply(&mut p);
        assert_eq!(p.n_bytes, 200);
    }
}
