//! Core data types used throughout the cost estimation pipeline
//!
//! # Key Types
//!
//! - **`Level`**: an IP-prefix length; larger values are finer granularities
//! - **`TransitPair`**: a move between two levels, or from nothing to one level
//! - **`Threshold`**: admission cutoff for a query at a level
//! - **`CostRecord`**: packets consumed, bits of state, packets emitted
//!
//! # Example
//!
//! ```rust
//! use refinement_cost::types::{CostRecord, Threshold, TransitPair};
//!
//! let transit = TransitPair::new(8, 32).unwrap();
//! assert!(!transit.is_baseline());
//! assert_eq!(TransitPair::baseline(16).unwrap().low, 0);
//!
//! assert_eq!(Threshold::from_observed(0.0).value(), 2);
//! assert_eq!(CostRecord::zero(), CostRecord::new(0, 0, 0));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Identifier of a query instance (e.g. 111 for the left branch of origin 11)
pub type QueryId = u32;

/// Identifier of the traced workload a raw artifact was produced for
pub type OriginId = u32;

/// Positional tag of a stage inside a query pipeline; 0 is the packet source
pub type StageId = u32;

/// IP-prefix length used as aggregation granularity
pub type Level = u8;

/// Minute bucket parsed from a raw artifact name
pub type MinuteBucket = u32;

/// Timestamp column of a relation row (the primary grouping key of counts)
pub type Timestamp = u32;

/// A `(timestamp, row count)` pair reported for one stage of one transit
pub type Observation = (Timestamp, u64);

/// Widest prefix length for IPv4 addresses
pub const MAX_LEVEL: Level = 32;

/// Stage ids are prefixed by query instance in multiples of this value
pub const STAGE_ID_MODULUS: StageId = 1000;

/// Strip the query-instance prefix from a stage id
#[inline]
pub fn local_stage_id(stage: StageId) -> StageId {
    stage % STAGE_ID_MODULUS
}

/// Transition between two refinement levels
///
/// `low == 0` denotes the baseline transit "from nothing to `high`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransitPair {
    /// Coarser level (0 for the baseline)
    pub low: Level,
    /// Finer level
    pub high: Level,
}

impl TransitPair {
    /// Create a transit pair, requiring `low < high`
    pub fn new(low: Level, high: Level) -> Result<Self> {
        if low >= high {
            return Err(Error::Configuration(format!(
                "transit pair requires low < high, got ({}, {})",
                low, high
            )));
        }
        Ok(Self { low, high })
    }

    /// Baseline transit from nothing to `level`
    pub fn baseline(level: Level) -> Result<Self> {
        Self::new(0, level)
    }

    /// Whether this is a `(0, level)` baseline
    #[inline]
    pub fn is_baseline(&self) -> bool {
        self.low == 0
    }
}

impl fmt::Display for TransitPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.low, self.high)
    }
}

/// Measurement cost of one stage of one transit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CostRecord {
    /// Packets entering the stage
    pub packets_in: u64,
    /// Bits of intermediate state kept by stateful stages up to this one
    pub bits: u64,
    /// Packets leaving the stage
    pub packets_out: u64,
}

impl CostRecord {
    /// Create a record from its three components
    pub fn new(packets_in: u64, bits: u64, packets_out: u64) -> Self {
        Self {
            packets_in,
            bits,
            packets_out,
        }
    }

    /// The degenerate `(0, 0, 0)` record
    pub fn zero() -> Self {
        Self::default()
    }
}

impl fmt::Display for CostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.packets_in, self.bits, self.packets_out)
    }
}

/// Admission cutoff count for a query at a level
///
/// Calibrated thresholds never fall below [`Threshold::MIN_ADMISSIBLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Threshold(u64);

impl Threshold {
    /// Smallest meaningful admission count
    pub const MIN_ADMISSIBLE: u64 = 2;

    /// Threshold used when no calibration data exists
    pub fn floor() -> Self {
        Self(Self::MIN_ADMISSIBLE)
    }

    /// Build a threshold from an observed statistic
    ///
    /// The value is truncated towards zero and clamped to the floor, so
    /// empty distributions (0) and negative diff values both end up at 2.
    pub fn from_observed(value: f64) -> Self {
        if value.is_nan() || value < Self::MIN_ADMISSIBLE as f64 {
            return Self::floor();
        }
        Self(value.trunc() as u64)
    }

    /// Raw threshold value
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether a row value is admitted
    #[inline]
    pub fn admits(&self, value: i64) -> bool {
        value >= 0 && value as u64 >= self.0
    }

    /// Whether a row value is strictly above the threshold
    #[inline]
    pub fn exceeds(&self, value: i64) -> bool {
        value >= 0 && value as u64 > self.0
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transit_pair_ordering() {
        assert!(TransitPair::new(8, 8).is_err());
        assert!(TransitPair::new(16, 8).is_err());
        let pair = TransitPair::new(8, 16).unwrap();
        assert_eq!(pair.to_string(), "(8, 16)");
        assert!(TransitPair::baseline(8).unwrap() < pair);
        assert!(TransitPair::baseline(0).is_err());
    }

    #[test]
    fn test_local_stage_id() {
        assert_eq!(local_stage_id(113_002), 2);
        assert_eq!(local_stage_id(3), 3);
    }

    #[test]
    fn test_threshold_floor() {
        assert_eq!(Threshold::from_observed(0.0).value(), 2);
        assert_eq!(Threshold::from_observed(0.99).value(), 2);
        assert_eq!(Threshold::from_observed(1.0).value(), 2);
        assert_eq!(Threshold::from_observed(-40.0).value(), 2);
        assert_eq!(Threshold::from_observed(f64::NAN).value(), 2);
        assert_eq!(Threshold::from_observed(17.8).value(), 17);
    }

    #[test]
    fn test_threshold_admits() {
        let th = Threshold::from_observed(10.0);
        assert!(th.admits(10));
        assert!(th.admits(11));
        assert!(!th.admits(9));
        assert!(!th.admits(-10));
        assert!(!th.exceeds(10));
        assert!(th.exceeds(11));
        assert!(!th.exceeds(-11));
    }
}
