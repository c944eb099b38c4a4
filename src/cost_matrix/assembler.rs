//! Folding raw counts into cost records
//!
//! # Pricing
//!
//! Stage ids of a transit are walked in ascending order. For each pair of
//! consecutive partition stages `(prev, target)`:
//!
//! - if `prev` observed nothing, every stage after the first is `(0, 0, 0)`
//! - a Reduce or Distinct `target` consumes `count(prev)` packets and keeps
//!   `bits_per_row × count` bits for every stateful stage up to it
//! - a Reduce emits what the stage right after it emits when that stage is
//!   declared and counted, otherwise its own count; a Distinct emits its own
//!   count
//! - other targets keep no state and get no record
//!
//! A transit counted at a single stage only records that stage's output.

use std::collections::BTreeMap;

use super::{CostMatrix, StageCosts};
use crate::cost_matrix::artifact::RawCountArtifact;
use crate::error::{Error, Result};
use crate::query::{OperatorKind, StageCatalog, Workload};
use crate::transit::StageCounts;
use crate::types::{local_stage_id, CostRecord, OriginId, QueryId, StageId};

/// Builds a [`CostMatrix`] from raw count artifacts
#[derive(Debug, Clone)]
pub struct CostMatrixAssembler {
    catalog: StageCatalog,
    origins: BTreeMap<OriginId, Vec<QueryId>>,
}

impl CostMatrixAssembler {
    /// Assembler with an explicit catalog and origin fan-out
    pub fn new(catalog: StageCatalog, origins: BTreeMap<OriginId, Vec<QueryId>>) -> Self {
        Self { catalog, origins }
    }

    /// Assembler for every query of `workload`
    pub fn from_workload(workload: &Workload) -> Self {
        Self::new(workload.catalog(), workload.origin_instances())
    }

    /// Assemble a matrix from `artifacts`
    pub fn assemble(&self, artifacts: &[RawCountArtifact]) -> Result<CostMatrix> {
        let mut matrix = CostMatrix::new();
        for artifact in artifacts {
            self.add_artifact(&mut matrix, artifact)?;
        }
        tracing::info!(
            artifacts = artifacts.len(),
            records = matrix.len(),
            "Assembled cost matrix"
        );
        Ok(matrix)
    }

    /// Fold one artifact into `matrix`
    ///
    /// Artifacts of unknown origins are skipped.
    pub fn add_artifact(&self, matrix: &mut CostMatrix, artifact: &RawCountArtifact) -> Result<()> {
        let Some(instances) = self.origins.get(&artifact.origin) else {
            tracing::warn!(
                origin = artifact.origin,
                minute = artifact.minute,
                "Skipping artifact of unknown origin"
            );
            return Ok(());
        };

        for &query in instances {
            let transits = artifact.counts.get(&query).ok_or_else(|| {
                Error::Artifact(format!(
                    "origin {} minute {} has no counts for query {}",
                    artifact.origin, artifact.minute, query
                ))
            })?;
            matrix.touch(artifact.minute, query);
            for (&transit, stages) in transits {
                let costs = self.stage_costs(query, stages)?;
                matrix.set_transit(artifact.minute, query, transit, costs);
            }
        }
        Ok(())
    }

    /// Cost records of one transit of `query`
    pub fn stage_costs(&self, query: QueryId, stages: &StageCounts) -> Result<StageCosts> {
        let tids: Vec<StageId> = stages.keys().copied().collect();
        let count = |tid: StageId| first_count(stages, tid);
        let mut costs = StageCosts::new();

        if let [only] = tids.as_slice() {
            costs.insert(local_stage_id(*only), CostRecord::new(0, 0, count(*only)));
            return Ok(costs);
        }

        for window in tids.windows(2) {
            let (prev, target) = (window[0], window[1]);

            if stages.get(&prev).map_or(true, Vec::is_empty) {
                for &tid in &tids[1..] {
                    costs.insert(local_stage_id(tid), CostRecord::zero());
                }
                continue;
            }
            if !self.catalog.kind(query, target)?.is_stateful() {
                continue;
            }

            let mut bits = 0;
            let mut packets_out = 0;
            for &tid in &tids[1..] {
                let kind = self.catalog.kind(query, tid)?;
                if let Some(per_row) = kind.bits_per_row() {
                    bits += per_row * count(tid);
                    packets_out = match kind {
                        OperatorKind::Reduce => {
                            let next = target + 1;
                            if self.catalog.contains(query, next) && stages.contains_key(&next) {
                                count(next)
                            } else {
                                count(target)
                            }
                        },
                        _ => count(target),
                    };
                }
                if tid == target {
                    break;
                }
            }
            costs.insert(
                local_stage_id(target),
                CostRecord::new(count(prev), bits, packets_out),
            );
        }
        Ok(costs)
    }
}

/// Count of the first observation of `tid`; 0 when nothing was observed
fn first_count(stages: &StageCounts, tid: StageId) -> u64 {
    stages
        .get(&tid)
        .and_then(|observations| observations.first())
        .map(|&(_, count)| count)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::standard_workload;
    use crate::transit::TransitCounts;
    use crate::types::TransitPair;

    fn assembler() -> CostMatrixAssembler {
        CostMatrixAssembler::from_workload(&standard_workload().unwrap())
    }

    fn counts(entries: &[(StageId, &[(u32, u64)])]) -> StageCounts {
        entries.iter().map(|(tid, obs)| (*tid, obs.to_vec())).collect()
    }

    #[test]
    fn test_reduce_then_filter() {
        let stages = counts(&[(0, &[(1, 100)]), (2, &[(1, 40)]), (3, &[(1, 7)])]);
        let costs = assembler().stage_costs(2, &stages).unwrap();
        assert_eq!(costs.len(), 1);
        assert_eq!(costs[&2], CostRecord::new(100, 1280, 7));
    }

    #[test]
    fn test_distinct_then_reduce() {
        let stages = counts(&[(0, &[(1, 500)]), (2, &[(1, 40)]), (4, &[(1, 10)]), (5, &[(1, 3)])]);
        let costs = assembler().stage_costs(3, &stages).unwrap();
        assert_eq!(costs[&2], CostRecord::new(500, 40, 40));
        assert_eq!(costs[&4], CostRecord::new(40, 40 + 320, 3));
        assert!(!costs.contains_key(&5));
    }

    #[test]
    fn test_reduce_without_next_stage_emits_own_count() {
        let stages = counts(&[(0, &[(1, 90)]), (2, &[(1, 12)])]);
        let costs = assembler().stage_costs(112, &stages).unwrap();
        assert_eq!(costs[&2], CostRecord::new(90, 384, 12));
    }

    #[test]
    fn test_empty_source_zeroes_every_stage() {
        let stages = counts(&[(0, &[]), (2, &[]), (3, &[])]);
        let costs = assembler().stage_costs(1, &stages).unwrap();
        assert_eq!(costs[&2], CostRecord::zero());
        assert_eq!(costs[&3], CostRecord::zero());
    }

    #[test]
    fn test_single_stage_transit() {
        let stages = counts(&[(2, &[(1, 5)])]);
        let costs = assembler().stage_costs(113, &stages).unwrap();
        assert_eq!(costs[&2], CostRecord::new(0, 0, 5));
    }

    #[test]
    fn test_prefixed_stage_ids() {
        let stages = counts(&[(3_000, &[(1, 100)]), (3_002, &[(1, 40)]), (3_004, &[(1, 10)]), (3_005, &[(1, 1)])]);
        let costs = assembler().stage_costs(3, &stages).unwrap();
        assert_eq!(costs[&4], CostRecord::new(40, 360, 1));
    }

    #[test]
    fn test_unknown_stage() {
        let stages = counts(&[(0, &[(1, 100)]), (7, &[(1, 40)])]);
        let err = assembler().stage_costs(2, &stages).unwrap_err();
        assert!(matches!(err, Error::UnknownQueryStage { query: 2, stage: 7 }));
    }

    #[test]
    fn test_origin_fan_out() {
        let mut counts_by_query = TransitCounts::new();
        for q in [111, 112, 113] {
            let mut transits = BTreeMap::new();
            transits.insert(TransitPair { low: 0, high: 8 }, counts(&[(2, &[(1, q as u64)])]));
            counts_by_query.insert(q, transits);
        }
        let artifacts = vec![
            RawCountArtifact::new(11, 1301, counts_by_query),
            RawCountArtifact::new(42, 1301, TransitCounts::new()),
        ];
        let matrix = assembler().assemble(&artifacts).unwrap();

        assert_eq!(matrix.queries(1301), vec![111, 112, 113]);
        let baseline = TransitPair { low: 0, high: 8 };
        assert_eq!(matrix.get(1301, 112, baseline, 2), Some(&CostRecord::new(0, 0, 112)));
    }

    #[test]
    fn test_missing_instance_is_an_error() {
        let artifact = RawCountArtifact::new(11, 1, TransitCounts::new());
        assert!(matches!(assembler().assemble(&[artifact]), Err(Error::Artifact(_))));
    }
}
