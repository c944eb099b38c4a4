//! Percentile estimation for finest-level thresholds
//!
//! Two estimators are available:
//!
//! - **Exact**: linear interpolation between the two closest ranks, using
//!   O(n) selection instead of a full sort
//! - **TDigest**: streaming sketch for very large distributions, at the cost
//!   of accuracy away from the tails

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tdigest::TDigest;

use crate::query::Query;
use crate::types::{Level, QueryId};

/// Default number of t-digest centroids
pub const DEFAULT_DIGEST_SIZE: usize = 100;

/// How the finest-level percentile is computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PercentileEstimator {
    /// Linear interpolation between closest ranks
    #[default]
    Exact,
    /// T-digest sketch with at most `max_size` centroids
    TDigest {
        /// Centroid budget
        max_size: usize,
    },
}

impl PercentileEstimator {
    /// Value at `percentile` (0-100) of `values`; 0 when `values` is empty
    pub fn estimate(&self, values: &[f64], percentile: f64) -> f64 {
        let values: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
        if values.is_empty() {
            return 0.0;
        }
        let q = (percentile / 100.0).clamp(0.0, 1.0);

        match *self {
            PercentileEstimator::Exact => exact_linear(values, q),
            PercentileEstimator::TDigest { max_size } => {
                let digest = TDigest::new_with_size(max_size.max(1)).merge_unsorted(values);
                digest.estimate_quantile(q)
            },
        }
    }
}

fn exact_linear(mut values: Vec<f64>, q: f64) -> f64 {
    if values.len() == 1 {
        return values[0];
    }
    let rank = q * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let frac = rank - lo as f64;

    let cmp = |a: &f64, b: &f64| a.partial_cmp(b).unwrap_or(Ordering::Equal);
    let (_, lower, upper_part) = values.select_nth_unstable_by(lo, cmp);
    let lower = *lower;
    if frac == 0.0 || upper_part.is_empty() {
        return lower;
    }
    // Everything right of the pivot is >= it, so the next rank is their minimum
    let upper = upper_part.iter().copied().fold(f64::INFINITY, f64::min);
    lower + (upper - lower) * frac
}

/// Percentile override for a query, optionally at a single level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileRule {
    /// Query instance id
    pub query: QueryId,
    /// Level the rule applies to; every level when absent
    #[serde(default)]
    pub level: Option<Level>,
    /// Percentile in (0, 100]
    pub percentile: f64,
}

/// Resolve the percentile of `query` at `level`
///
/// A rule naming the level wins over a rule for every level, which wins over
/// the percentile declared on the query's filter.
pub fn resolve_percentile(rules: &[PercentileRule], query: &Query, level: Level) -> Option<f64> {
    let for_query = || rules.iter().filter(|r| r.query == query.id());
    for_query()
        .find(|r| r.level == Some(level))
        .or_else(|| for_query().find(|r| r.level.is_none()))
        .map(|r| r.percentile)
        .or_else(|| query.percentile())
}
