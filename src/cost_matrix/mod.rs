//! Cost matrix
//!
//! Maps `(minute, query, transit, stage)` to the [`CostRecord`] of that
//! stage. Every level of the matrix is an ordered map, so two matrices built
//! from the same inputs serialize to the same bytes.
//!
//! # Persistence
//!
//! The matrix is stored with bincode ([`CostMatrix::save`] and
//! [`CostMatrix::load`]). For inspection it can be flattened into rows and
//! exported as JSON ([`CostMatrix::to_json`]).

pub mod artifact;
pub mod assembler;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{CostRecord, Level, MinuteBucket, QueryId, StageId, TransitPair};

pub use artifact::RawCountArtifact;
pub use assembler::CostMatrixAssembler;

/// Cost record per local stage id
pub type StageCosts = BTreeMap<StageId, CostRecord>;

type QueryCosts = BTreeMap<TransitPair, StageCosts>;

/// Costs per minute, query, transit and stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostMatrix {
    minutes: BTreeMap<MinuteBucket, BTreeMap<QueryId, QueryCosts>>,
}

/// One flattened matrix entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRow {
    /// Minute bucket
    pub minute: MinuteBucket,
    /// Query instance
    pub query: QueryId,
    /// Coarse end of the transit (0 for baselines)
    pub low: Level,
    /// Fine end of the transit
    pub high: Level,
    /// Local stage id
    pub stage: StageId,
    /// Packets entering the stage
    pub packets_in: u64,
    /// Bits of state
    pub bits: u64,
    /// Packets leaving the stage
    pub packets_out: u64,
}

impl CostMatrix {
    /// Empty matrix
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `query` has an entry in `minute`, even without transits
    pub fn touch(&mut self, minute: MinuteBucket, query: QueryId) {
        self.minutes.entry(minute).or_default().entry(query).or_default();
    }

    /// Set one record
    pub fn insert(
        &mut self,
        minute: MinuteBucket,
        query: QueryId,
        transit: TransitPair,
        stage: StageId,
        record: CostRecord,
    ) {
        self.minutes
            .entry(minute)
            .or_default()
            .entry(query)
            .or_default()
            .entry(transit)
            .or_default()
            .insert(stage, record);
    }

    /// Replace every record of one transit
    pub fn set_transit(
        &mut self,
        minute: MinuteBucket,
        query: QueryId,
        transit: TransitPair,
        costs: StageCosts,
    ) {
        self.minutes
            .entry(minute)
            .or_default()
            .entry(query)
            .or_default()
            .insert(transit, costs);
    }

    /// One record
    pub fn get(
        &self,
        minute: MinuteBucket,
        query: QueryId,
        transit: TransitPair,
        stage: StageId,
    ) -> Option<&CostRecord> {
        self.transit(minute, query, transit)?.get(&stage)
    }

    /// Records of one transit
    pub fn transit(&self, minute: MinuteBucket, query: QueryId, transit: TransitPair) -> Option<&StageCosts> {
        self.minutes.get(&minute)?.get(&query)?.get(&transit)
    }

    /// Transits recorded for a query in a minute
    pub fn transits(&self, minute: MinuteBucket, query: QueryId) -> Vec<TransitPair> {
        self.minutes
            .get(&minute)
            .and_then(|queries| queries.get(&query))
            .map(|transits| transits.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Minute buckets, ascending
    pub fn minutes(&self) -> Vec<MinuteBucket> {
        self.minutes.keys().copied().collect()
    }

    /// Queries recorded in a minute, ascending
    pub fn queries(&self, minute: MinuteBucket) -> Vec<QueryId> {
        self.minutes
            .get(&minute)
            .map(|queries| queries.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.minutes
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    /// Whether the matrix holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every entry of `other`, replacing transits present in both
    pub fn merge(&mut self, other: CostMatrix) {
        for (minute, queries) in other.minutes {
            let mine = self.minutes.entry(minute).or_default();
            for (query, transits) in queries {
                mine.entry(query).or_default().extend(transits);
            }
        }
    }

    /// Keep only transits whose endpoints are both reference levels
    ///
    /// 0 always counts as a reference level, so baselines survive whenever
    /// their fine end does. Returns the number of transits dropped.
    pub fn prune_levels(&mut self, reference: &[Level]) -> usize {
        let mut allowed: BTreeSet<Level> = reference.iter().copied().collect();
        allowed.insert(0);

        let mut dropped = 0;
        for queries in self.minutes.values_mut() {
            for transits in queries.values_mut() {
                let before = transits.len();
                transits.retain(|pair, _| allowed.contains(&pair.low) && allowed.contains(&pair.high));
                dropped += before - transits.len();
            }
        }
        tracing::debug!(dropped, reference = ?reference, "Pruned cost matrix");
        dropped
    }

    /// Flatten into rows ordered by minute, query, transit and stage
    pub fn to_rows(&self) -> Vec<CostRow> {
        let mut rows = Vec::with_capacity(self.len());
        for (&minute, queries) in &self.minutes {
            for (&query, transits) in queries {
                for (pair, stages) in transits {
                    for (&stage, record) in stages {
                        rows.push(CostRow {
                            minute,
                            query,
                            low: pair.low,
                            high: pair.high,
                            stage,
                            packets_in: record.packets_in,
                            bits: record.bits,
                            packets_out: record.packets_out,
                        });
                    }
                }
            }
        }
        rows
    }

    /// Flattened rows as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.to_rows()).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Encode with bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from bincode
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Save atomically to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        artifact::write_atomic(path, &self.to_bytes()?)?;
        tracing::info!(path = %path.display(), records = self.len(), "Saved cost matrix");
        Ok(())
    }

    /// Load from `path`
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(low: Level, high: Level) -> TransitPair {
        TransitPair { low, high }
    }

    fn full_matrix() -> CostMatrix {
        let mut matrix = CostMatrix::new();
        let levels: Vec<Level> = (1..=8).map(|l| l * 4).collect();
        for &high in &levels {
            matrix.insert(0, 1, pair(0, high), 2, CostRecord::new(1, 2, 3));
            for &low in levels.iter().filter(|&&l| l < high) {
                matrix.insert(0, 1, pair(low, high), 2, CostRecord::new(1, 2, 3));
            }
        }
        matrix
    }

    #[test]
    fn test_prune_to_reference_levels() {
        let mut matrix = full_matrix();
        // 8 baselines + 28 level pairs
        assert_eq!(matrix.transits(0, 1).len(), 36);

        matrix.prune_levels(&[0, 8, 16, 24, 32]);
        let kept = matrix.transits(0, 1);
        let pruned = [4, 12, 20, 28];
        assert!(kept
            .iter()
            .all(|p| !pruned.contains(&p.low) && !pruned.contains(&p.high)));
        // 4 baselines + 6 pairs among {8, 16, 24, 32}
        assert_eq!(kept.len(), 10);
    }

    #[test]
    fn test_prune_keeps_baselines_without_zero() {
        let mut matrix = full_matrix();
        matrix.prune_levels(&[32]);
        assert_eq!(matrix.transits(0, 1), vec![pair(0, 32)]);
    }

    #[test]
    fn test_rows_and_json() {
        let mut matrix = CostMatrix::new();
        matrix.insert(1301, 2, pair(0, 32), 2, CostRecord::new(100, 1280, 7));
        matrix.insert(1301, 2, pair(8, 32), 2, CostRecord::new(50, 640, 7));

        let rows = matrix.to_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].low, 0);
        assert_eq!(rows[1].bits, 640);

        let json: serde_json::Value = serde_json::from_str(&matrix.to_json().unwrap()).unwrap();
        assert_eq!(json[0]["packets_in"], 100);
        assert_eq!(json[1]["low"], 8);
    }

    #[test]
    fn test_bincode_roundtrip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.bin");
        let matrix = full_matrix();
        matrix.save(&path).unwrap();
        assert_eq!(CostMatrix::load(&path).unwrap(), matrix);
    }

    #[test]
    fn test_merge_replaces_transits() {
        let mut a = CostMatrix::new();
        a.insert(1, 2, pair(0, 8), 2, CostRecord::new(1, 1, 1));
        let mut b = CostMatrix::new();
        b.insert(1, 2, pair(0, 8), 2, CostRecord::new(9, 9, 9));
        b.insert(2, 2, pair(0, 8), 2, CostRecord::zero());
        a.merge(b);
        assert_eq!(a.get(1, 2, pair(0, 8), 2), Some(&CostRecord::new(9, 9, 9)));
        assert_eq!(a.minutes(), vec![1, 2]);
    }
}
