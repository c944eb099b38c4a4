//! Calibration state threaded through the level loop

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::CheckpointNamespace;
use crate::types::{Level, QueryId, Threshold};

/// Thresholds per query per level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdTable {
    thresholds: BTreeMap<QueryId, BTreeMap<Level, Threshold>>,
}

impl ThresholdTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the threshold of `query` at `level`
    pub fn insert(&mut self, query: QueryId, level: Level, threshold: Threshold) {
        self.thresholds.entry(query).or_default().insert(level, threshold);
    }

    /// Threshold of `query` at `level`
    pub fn get(&self, query: QueryId, level: Level) -> Option<Threshold> {
        self.thresholds.get(&query)?.get(&level).copied()
    }

    /// Thresholds of `query`, by level
    pub fn levels(&self, query: QueryId) -> Option<&BTreeMap<Level, Threshold>> {
        self.thresholds.get(&query)
    }

    /// Calibrated query ids
    pub fn queries(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.thresholds.keys().copied()
    }

    /// Every `(query, level, threshold)`, ordered
    pub fn iter(&self) -> impl Iterator<Item = (QueryId, Level, Threshold)> + '_ {
        self.thresholds
            .iter()
            .flat_map(|(&q, levels)| levels.iter().map(move |(&l, &t)| (q, l, t)))
    }

    /// Take every entry of `other`
    pub fn merge(&mut self, other: ThresholdTable) {
        for (query, levels) in other.thresholds {
            self.thresholds.entry(query).or_default().extend(levels);
        }
    }

    /// Number of `(query, level)` entries
    pub fn len(&self) -> usize {
        self.thresholds.values().map(BTreeMap::len).sum()
    }

    /// Whether nothing was calibrated
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thresholds and filtered checkpoints of one calibration run
#[derive(Debug, Clone)]
pub struct CalibrationContext {
    namespace: CheckpointNamespace,
    thresholds: ThresholdTable,
    materialized: BTreeMap<(QueryId, Level), String>,
}

impl CalibrationContext {
    /// Fresh context writing under `namespace`
    pub fn new(namespace: CheckpointNamespace) -> Self {
        Self {
            namespace,
            thresholds: ThresholdTable::new(),
            materialized: BTreeMap::new(),
        }
    }

    /// Checkpoint namespace of the run
    pub fn namespace(&self) -> &CheckpointNamespace {
        &self.namespace
    }

    /// Thresholds calibrated so far
    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// Record a calibrated level
    pub fn record(&mut self, query: QueryId, level: Level, threshold: Threshold, checkpoint: String) {
        self.thresholds.insert(query, level, threshold);
        self.materialized.insert((query, level), checkpoint);
    }

    /// Name of the filtered checkpoint of `query` at `level`, once calibrated
    pub fn filter_checkpoint(&self, query: QueryId, level: Level) -> Option<&str> {
        self.materialized.get(&(query, level)).map(String::as_str)
    }

    /// Consume the context, keeping the thresholds
    pub fn into_thresholds(self) -> ThresholdTable {
        self.thresholds
    }
}
