//! Transit counting
//!
//! For every query and partition stage, counts the rows a stage emits when
//! the query is refined directly to one level (the `(0, level)` baseline) or
//! refined from a coarse level to a finer one (`(low, high)`).
//!
//! # Cross-level transits
//!
//! Going from `low` to `high` only the traffic that the coarse level flagged
//! is re-examined. The flagged keys are the refinement values in the terminal
//! output of the query's baseline query at `low`; a row of the `high`
//! evaluation is kept when its refinement value masked to `low` is one of
//! them.
//!
//! Every partition of a level and every level pair is independent, so both
//! phases fan out over rayon.

use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};

use crate::calibration::ThresholdTable;
use crate::engine::{CheckpointNamespace, CheckpointStore, Evaluator};
use crate::error::{Error, Result};
use crate::query::QueryGroup;
use crate::refinement::RefinementHierarchy;
use crate::relation::{ParallelConfig, Relation};
use crate::types::{Level, Observation, QueryId, StageId, TransitPair};

/// Observations per partition stage
pub type StageCounts = BTreeMap<StageId, Vec<Observation>>;

/// Observations per query, transit and partition stage
pub type TransitCounts = BTreeMap<QueryId, BTreeMap<TransitPair, StageCounts>>;

type Counted = (QueryId, TransitPair, StageId, Vec<Observation>);

/// Counts transits of every query of an origin group
#[derive(Debug, Clone)]
pub struct TransitCounter {
    hierarchy: RefinementHierarchy,
    parallel: ParallelConfig,
}

impl TransitCounter {
    /// Counter over every level of `hierarchy`
    pub fn new(hierarchy: RefinementHierarchy) -> Self {
        Self {
            hierarchy,
            parallel: ParallelConfig::default(),
        }
    }

    /// Grouping parallelism
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Baseline and cross-level counts of every query of `group`
    ///
    /// `thresholds` must hold every calibrated level of the group's queries.
    pub fn count_group<S>(
        &self,
        group: &QueryGroup,
        source: &Relation,
        store: &S,
        namespace: &CheckpointNamespace,
        thresholds: &ThresholdTable,
    ) -> Result<TransitCounts>
    where
        S: CheckpointStore + ?Sized,
    {
        let evaluator = Evaluator::new(group, source, self.parallel);
        let mut counts = TransitCounts::new();

        let baseline_jobs = self.baseline_jobs(group)?;
        let baselines = baseline_jobs
            .par_iter()
            .map(|&(query, level, stage)| -> Result<Counted> {
                let q = group.query(query).ok_or(Error::UnknownQuery(query))?;
                let relation = evaluator.evaluate(q, level, stage, thresholds)?;
                let observed = relation.count_by_ts();
                store.write(&namespace.transit_output(query, level, stage), relation)?;
                Ok((query, TransitPair { low: 0, high: level }, stage, observed))
            })
            .collect::<Result<Vec<Counted>>>()?;
        insert_all(&mut counts, baselines);

        let flagged = self.flagged_keys(group, store, namespace)?;
        let cross_jobs = self.cross_jobs(group)?;
        let crossed = cross_jobs
            .par_iter()
            .map(|&(query, pair, stage)| -> Result<Counted> {
                let high = store.read(&namespace.transit_output(query, pair.high, stage))?;
                let baseline = group.baseline_of(query);
                let observed = match flagged.get(&(baseline, pair.low)) {
                    Some(Some(allowed)) => high.retain_refined_in(pair.low, allowed).count_by_ts(),
                    // Baseline output carries no refinement column
                    _ => high.count_by_ts(),
                };
                Ok((query, pair, stage, observed))
            })
            .collect::<Result<Vec<Counted>>>()?;
        insert_all(&mut counts, crossed);

        for (query, transits) in &counts {
            tracing::debug!(
                origin = group.origin(),
                query,
                transits = transits.len(),
                "Counted transits"
            );
        }
        Ok(counts)
    }

    fn baseline_jobs(&self, group: &QueryGroup) -> Result<Vec<(QueryId, Level, StageId)>> {
        let mut jobs = Vec::new();
        for query in group.queries() {
            let plan = group.plan(query.id()).ok_or(Error::UnknownQuery(query.id()))?;
            for &level in self.hierarchy.levels() {
                jobs.extend(plan.stages().iter().map(|&stage| (query.id(), level, stage)));
            }
        }
        Ok(jobs)
    }

    fn cross_jobs(&self, group: &QueryGroup) -> Result<Vec<(QueryId, TransitPair, StageId)>> {
        let pairs = self.hierarchy.transit_pairs();
        let mut jobs = Vec::new();
        for query in group.queries() {
            let plan = group.plan(query.id()).ok_or(Error::UnknownQuery(query.id()))?;
            for &pair in &pairs {
                jobs.extend(plan.stages().iter().map(|&stage| (query.id(), pair, stage)));
            }
        }
        Ok(jobs)
    }

    /// Refinement values of each baseline query's terminal output, per level
    fn flagged_keys<S>(
        &self,
        group: &QueryGroup,
        store: &S,
        namespace: &CheckpointNamespace,
    ) -> Result<BTreeMap<(QueryId, Level), Option<HashSet<u64>>>>
    where
        S: CheckpointStore + ?Sized,
    {
        let baselines: HashSet<QueryId> = group.queries().iter().map(|q| group.baseline_of(q.id())).collect();
        let mut flagged = BTreeMap::new();
        for baseline in baselines {
            let plan = group.plan(baseline).ok_or(Error::UnknownQuery(baseline))?;
            for &level in self.hierarchy.levels() {
                let terminal = store.read(&namespace.transit_output(baseline, level, plan.terminal()))?;
                flagged.insert((baseline, level), terminal.refinement_values());
            }
        }
        Ok(flagged)
    }
}

fn insert_all(counts: &mut TransitCounts, observed: Vec<Counted>) {
    for (query, pair, stage, observations) in observed {
        counts
            .entry(query)
            .or_default()
            .entry(pair)
            .or_default()
            .insert(stage, observations);
    }
}
