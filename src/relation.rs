//! Relations - immutable keyed row sets passed between pipeline stages
//!
//! A relation is an ordered list of `(ts, key columns, value)` rows with a
//! schema naming the key columns. One column may be the query's refinement
//! column: the IP prefix that is masked when moving between levels.
//!
//! Rows are kept sorted so that every derived artifact (checkpoints, counts,
//! the final matrix) is identical across runs.
//!
//! # Morsel-Driven Grouping
//!
//! Large groupings are split into morsels and folded in parallel with rayon,
//! then merged and sorted. Small inputs stay on the calling thread.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::packet::{Field, PacketRecord};
use crate::refinement::mask_prefix;
use crate::types::{Level, Observation, Threshold, Timestamp};

// ============================================================================
// Parallel Configuration
// ============================================================================

/// Configuration for parallel grouping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Size of each morsel (rows per work unit)
    pub morsel_size: usize,

    /// Minimum rows to enable parallelism (below this, run sequential)
    pub parallel_threshold: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            morsel_size: 4096,
            parallel_threshold: 10_000,
        }
    }
}

impl ParallelConfig {
    /// Set morsel size (rows per parallel work unit)
    pub fn with_morsel_size(mut self, size: usize) -> Self {
        self.morsel_size = size.max(256);
        self
    }

    /// Set threshold below which to run sequentially
    pub fn with_threshold(mut self, rows: usize) -> Self {
        self.parallel_threshold = rows;
        self
    }

    /// Never split work across threads
    pub fn sequential() -> Self {
        Self {
            morsel_size: 4096,
            parallel_threshold: usize::MAX,
        }
    }
}

// ============================================================================
// Rows and Schema
// ============================================================================

/// Grouping key of a row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    /// Primary key; counts are reported per timestamp
    pub ts: Timestamp,
    /// Key columns, in schema order
    pub columns: Vec<u64>,
}

/// A keyed value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Row {
    /// Grouping key
    pub key: RowKey,
    /// Count, byte sum or combined value; the diff combinator can go negative
    pub value: i64,
}

/// Names of a relation's key columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Key column fields
    pub columns: Vec<Field>,
    /// Index of the refinement column, if the key still carries it
    pub refinement: Option<usize>,
}

impl Schema {
    /// Position of a field among the key columns
    pub fn position(&self, field: Field) -> Option<usize> {
        self.columns.iter().position(|&f| f == field)
    }
}

/// How a map stage computes the value of its output rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapValue {
    /// Every row counts once
    One,
    /// Take the value from a field of the input row
    Field(Field),
    /// Keep the input row's value
    Keep,
}

// ============================================================================
// Relation
// ============================================================================

/// Immutable, sorted set of keyed rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    schema: Schema,
    rows: Vec<Row>,
}

impl Relation {
    /// Build a relation, sorting the rows
    pub fn new(schema: Schema, mut rows: Vec<Row>) -> Self {
        rows.sort_unstable();
        Self { schema, rows }
    }

    /// Empty relation with the given schema
    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Source relation: one row per packet keyed by every header field
    pub fn from_packets(packets: &[PacketRecord]) -> Self {
        let rows = packets
            .iter()
            .map(|p| Row {
                key: RowKey {
                    ts: p.ts,
                    columns: Field::ALL.iter().map(|&f| p.field(f)).collect(),
                },
                value: 1,
            })
            .collect();
        Self::new(
            Schema {
                columns: Field::ALL.to_vec(),
                refinement: None,
            },
            rows,
        )
    }

    /// Schema of the key columns
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Sorted rows
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the relation has no rows
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row values as floats, in row order
    pub fn values(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.value as f64).collect()
    }

    /// Re-key rows onto `keys`, masking `refinement` at `level` when present
    ///
    /// Fails if a requested field is not a column of this relation.
    pub fn project(
        &self,
        keys: &[Field],
        value: MapValue,
        refinement: Option<Field>,
        level: Level,
    ) -> Result<Self> {
        let positions = keys
            .iter()
            .map(|&f| self.column_of(f))
            .collect::<Result<Vec<usize>>>()?;
        let value_pos = match value {
            MapValue::Field(f) => Some(self.column_of(f)?),
            _ => None,
        };
        let refined_at = refinement.and_then(|r| keys.iter().position(|&f| f == r));

        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut columns: Vec<u64> = positions.iter().map(|&p| row.key.columns[p]).collect();
                if let Some(i) = refined_at {
                    columns[i] = mask_prefix(columns[i] as u32, level) as u64;
                }
                let value = match (value, value_pos) {
                    (MapValue::One, _) => 1,
                    (MapValue::Field(_), Some(p)) => row.key.columns[p] as i64,
                    _ => row.value,
                };
                Row {
                    key: RowKey {
                        ts: row.key.ts,
                        columns,
                    },
                    value,
                }
            })
            .collect();

        Ok(Self::new(
            Schema {
                columns: keys.to_vec(),
                refinement: refined_at,
            },
            rows,
        ))
    }

    /// Sum values per key
    pub fn reduce_by_key(&self, config: ParallelConfig) -> Self {
        let grouped = group_rows(&self.rows, config, |acc: &mut i64, v| *acc += v);
        self.with_grouped(grouped)
    }

    /// One row per distinct key, value 1
    pub fn distinct(&self) -> Self {
        let mut rows: Vec<Row> = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            // Rows are sorted, so duplicates are adjacent
            if rows.last().map(|last| last.key != row.key).unwrap_or(true) {
                rows.push(Row {
                    key: row.key.clone(),
                    value: 1,
                });
            }
        }
        Self {
            schema: self.schema.clone(),
            rows,
        }
    }

    /// Keep rows admitted by `threshold`
    pub fn filter_admitted(&self, threshold: Threshold) -> Self {
        self.retain(|row| threshold.admits(row.value))
    }

    /// Keep rows strictly above `threshold`
    pub fn filter_above(&self, threshold: Threshold) -> Self {
        self.retain(|row| threshold.exceeds(row.value))
    }

    /// Mask the refinement column down to `level`
    ///
    /// Rows are not merged; coarsening usually produces duplicate keys.
    pub fn rekey(&self, level: Level) -> Self {
        let Some(col) = self.schema.refinement else {
            return self.clone();
        };
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut key = row.key.clone();
                key.columns[col] = mask_prefix(key.columns[col] as u32, level) as u64;
                Row {
                    key,
                    value: row.value,
                }
            })
            .collect();
        Self::new(self.schema.clone(), rows)
    }

    /// Distinct keys of this relation
    pub fn key_set(&self) -> HashSet<RowKey> {
        self.rows.iter().map(|r| r.key.clone()).collect()
    }

    /// Keep rows whose key is in `keys`
    pub fn semi_join(&self, keys: &HashSet<RowKey>) -> Self {
        self.retain(|row| keys.contains(&row.key))
    }

    /// Left outer join on the full key
    ///
    /// Every left row is paired with each right row of the same key and the
    /// pair is folded by `combine`; a left row without a partner is folded
    /// with `None`. The output keeps the left schema.
    pub fn left_outer_join<F>(&self, right: &Relation, combine: F) -> Self
    where
        F: Fn(i64, Option<i64>) -> i64,
    {
        let mut by_key: HashMap<&RowKey, Vec<i64>> = HashMap::new();
        for row in &right.rows {
            by_key.entry(&row.key).or_default().push(row.value);
        }

        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            match by_key.get(&row.key) {
                Some(values) => {
                    for &r in values {
                        rows.push(Row {
                            key: row.key.clone(),
                            value: combine(row.value, Some(r)),
                        });
                    }
                },
                None => rows.push(Row {
                    key: row.key.clone(),
                    value: combine(row.value, None),
                }),
            }
        }
        Self::new(self.schema.clone(), rows)
    }

    /// Distinct refinement-column values
    ///
    /// Returns `None` when the key no longer carries the refinement column.
    pub fn refinement_values(&self) -> Option<HashSet<u64>> {
        let col = self.schema.refinement?;
        Some(self.rows.iter().map(|r| r.key.columns[col]).collect())
    }

    /// Keep rows whose refinement value, masked to `level`, is in `allowed`
    ///
    /// Relations without a refinement column are returned unchanged.
    pub fn retain_refined_in(&self, level: Level, allowed: &HashSet<u64>) -> Self {
        let Some(col) = self.schema.refinement else {
            return self.clone();
        };
        self.retain(|row| {
            let coarse = mask_prefix(row.key.columns[col] as u32, level) as u64;
            allowed.contains(&coarse)
        })
    }

    /// Row count per timestamp, ascending by timestamp
    pub fn count_by_ts(&self) -> Vec<Observation> {
        let mut counts: BTreeMap<Timestamp, u64> = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.key.ts).or_insert(0) += 1;
        }
        counts.into_iter().collect()
    }

    /// Smallest row value
    pub fn min_value(&self) -> Option<i64> {
        self.rows.iter().map(|r| r.value).min()
    }

    fn retain<P>(&self, keep: P) -> Self
    where
        P: Fn(&Row) -> bool,
    {
        Self {
            schema: self.schema.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    fn with_grouped(&self, grouped: HashMap<RowKey, i64>) -> Self {
        let rows = grouped
            .into_iter()
            .map(|(key, value)| Row { key, value })
            .collect();
        Self::new(self.schema.clone(), rows)
    }

    fn column_of(&self, field: Field) -> Result<usize> {
        self.schema.position(field).ok_or_else(|| {
            Error::Configuration(format!(
                "field {} is not a key column of the input relation",
                field
            ))
        })
    }
}

/// Fold row values per key, in parallel morsels for large inputs
fn group_rows<F>(rows: &[Row], config: ParallelConfig, fold: F) -> HashMap<RowKey, i64>
where
    F: Fn(&mut i64, i64) + Sync,
{
    if rows.len() < config.parallel_threshold {
        let mut groups: HashMap<RowKey, i64> = HashMap::new();
        for row in rows {
            fold(groups.entry(row.key.clone()).or_insert(0), row.value);
        }
        return groups;
    }

    rows.par_chunks(config.morsel_size.max(1))
        .map(|morsel| {
            let mut groups: HashMap<RowKey, i64> = HashMap::new();
            for row in morsel {
                fold(groups.entry(row.key.clone()).or_insert(0), row.value);
            }
            groups
        })
        .reduce(HashMap::new, |mut a, b| {
            for (key, value) in b {
                fold(a.entry(key).or_insert(0), value);
            }
            a
        })
}
