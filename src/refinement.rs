//! Refinement hierarchy: the IP-prefix levels a query is evaluated at
//!
//! Levels are always handed out finest first. Calibration depends on that
//! order: a coarser level reads the already-persisted output of the level
//! just finer than it.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::types::{Level, TransitPair, MAX_LEVEL};

/// Ordered set of refinement levels, finest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementHierarchy {
    levels: Vec<Level>,
}

impl RefinementHierarchy {
    /// Every multiple of `step` in `(0, max]`, sorted descending
    pub fn new(max: Level, step: Level) -> Result<Self> {
        if max == 0 || max > MAX_LEVEL {
            return Err(Error::Configuration(format!(
                "max refinement level must be in 1..={}, got {}",
                MAX_LEVEL, max
            )));
        }
        if step == 0 || step > max {
            return Err(Error::Configuration(format!(
                "refinement step must be in 1..={}, got {}",
                max, step
            )));
        }

        let mut levels: Vec<Level> = (step..=max).step_by(step as usize).collect();
        levels.sort_unstable_by(|a, b| b.cmp(a));
        Ok(Self { levels })
    }

    /// Build from an explicit level list (deduplicated, zero dropped)
    pub fn from_levels(levels: &[Level]) -> Result<Self> {
        let mut levels: Vec<Level> = levels.iter().copied().filter(|&l| l > 0).collect();
        if let Some(&bad) = levels.iter().find(|&&l| l > MAX_LEVEL) {
            return Err(Error::Configuration(format!(
                "refinement level {} exceeds {}",
                bad, MAX_LEVEL
            )));
        }
        levels.sort_unstable_by(|a, b| b.cmp(a));
        levels.dedup();
        if levels.is_empty() {
            return Err(Error::Configuration(
                "refinement hierarchy needs at least one level".to_string(),
            ));
        }
        Ok(Self { levels })
    }

    /// Levels, finest first
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// The finest level (calibrated from the percentile)
    pub fn finest(&self) -> Level {
        self.levels[0]
    }

    /// The coarsest level
    pub fn coarsest(&self) -> Level {
        self.levels[self.levels.len() - 1]
    }

    /// Whether `level` is the first one calibrated
    pub fn is_finest(&self, level: Level) -> bool {
        level == self.finest()
    }

    /// The next finer level than `level`, if any
    pub fn finer_than(&self, level: Level) -> Option<Level> {
        let pos = self.levels.iter().position(|&l| l == level)?;
        pos.checked_sub(1).map(|p| self.levels[p])
    }

    /// Baseline transits `(0, level)` for every level
    pub fn baselines(&self) -> Vec<TransitPair> {
        self.levels
            .iter()
            .map(|&level| TransitPair { low: 0, high: level })
            .collect()
    }

    /// Every `(low, high)` pair with `low < high`, ascending
    pub fn transit_pairs(&self) -> Vec<TransitPair> {
        let mut pairs = Vec::new();
        for &low in self.levels.iter().rev() {
            for &high in self.levels.iter().rev() {
                if low < high {
                    pairs.push(TransitPair { low, high });
                }
            }
        }
        pairs
    }

    /// Number of levels
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Always false; a hierarchy cannot be built empty
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Network address of `addr` under a prefix of `level` bits
#[inline]
pub fn mask_prefix(addr: u32, level: Level) -> u32 {
    match level {
        0 => 0,
        l if l >= MAX_LEVEL => addr,
        l => addr & (u32::MAX << (MAX_LEVEL - l)),
    }
}

/// Same as [`mask_prefix`] on an [`Ipv4Addr`]
pub fn mask_addr(addr: Ipv4Addr, level: Level) -> Ipv4Addr {
    Ipv4Addr::from(mask_prefix(u32::from(addr), level))
}
