//! Per-level threshold calibration
//!
//! # Algorithm
//!
//! Levels are visited finest first. For every query carrying a filter:
//!
//! 1. Evaluate the query up to the stage before its filter (the grouped
//!    aggregate) at the current level.
//! 2. At the finest level the threshold is the configured percentile of the
//!    aggregate's values.
//! 3. At a coarser level the aggregate is semi-joined with the filtered
//!    output of the next finer level, re-keyed to the current level. Only
//!    keys that survived the finer filter can survive here, and the threshold
//!    is the smallest surviving value.
//! 4. Thresholds are clamped to [`Threshold::MIN_ADMISSIBLE`]; the admitted
//!    rows are written once as the level's filtered checkpoint.
//!
//! Queries of a group are calibrated in dependency order, so a join reads
//! thresholds its branches calibrated at the same level.

use super::context::CalibrationContext;
use super::percentile::{resolve_percentile, PercentileEstimator, PercentileRule};
use crate::engine::{CheckpointNamespace, CheckpointStore, Evaluator};
use crate::error::{Error, Result};
use crate::query::{Query, QueryGroup};
use crate::refinement::RefinementHierarchy;
use crate::relation::{ParallelConfig, Relation};
use crate::types::{Level, Threshold};

/// Calibrates admission thresholds across a refinement hierarchy
#[derive(Debug, Clone)]
pub struct ThresholdCalibrator {
    hierarchy: RefinementHierarchy,
    estimator: PercentileEstimator,
    rules: Vec<PercentileRule>,
    parallel: ParallelConfig,
}

impl ThresholdCalibrator {
    /// Calibrator with exact percentiles and no overrides
    pub fn new(hierarchy: RefinementHierarchy) -> Self {
        Self {
            hierarchy,
            estimator: PercentileEstimator::default(),
            rules: Vec::new(),
            parallel: ParallelConfig::default(),
        }
    }

    /// Use `estimator` at the finest level
    pub fn with_estimator(mut self, estimator: PercentileEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Override query percentiles
    pub fn with_percentiles(mut self, rules: Vec<PercentileRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Grouping parallelism
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Levels being calibrated
    pub fn hierarchy(&self) -> &RefinementHierarchy {
        &self.hierarchy
    }

    /// Calibrate every filtered query of `group` at every level
    pub fn calibrate_group<S>(
        &self,
        group: &QueryGroup,
        source: &Relation,
        store: &S,
        namespace: CheckpointNamespace,
    ) -> Result<CalibrationContext>
    where
        S: CheckpointStore + ?Sized,
    {
        let evaluator = Evaluator::new(group, source, self.parallel);
        let mut ctx = CalibrationContext::new(namespace);

        for &level in self.hierarchy.levels() {
            for query in group.queries().iter().filter(|q| q.is_calibrated()) {
                self.calibrate_level(&evaluator, query, level, store, &mut ctx)?;
            }
        }
        Ok(ctx)
    }

    /// Calibrate `query` at `level`
    ///
    /// Every finer level must already be recorded in `ctx`.
    pub fn calibrate_level<S>(
        &self,
        evaluator: &Evaluator<'_>,
        query: &Query,
        level: Level,
        store: &S,
        ctx: &mut CalibrationContext,
    ) -> Result<Threshold>
    where
        S: CheckpointStore + ?Sized,
    {
        let filter = query.filter_stage().ok_or_else(|| Error::InvalidQuery {
            query: query.id(),
            reason: "query has no filter to calibrate".to_string(),
        })?;
        let aggregate = evaluator.evaluate(query, level, filter.id - 1, ctx.thresholds())?;

        let (threshold, admitted) = match self.hierarchy.finer_than(level) {
            None => {
                let percentile =
                    resolve_percentile(&self.rules, query, level).ok_or_else(|| Error::InvalidQuery {
                        query: query.id(),
                        reason: format!("no percentile to calibrate at level {}", level),
                    })?;
                let observed = self.estimator.estimate(&aggregate.values(), percentile);
                let threshold = Threshold::from_observed(observed);
                tracing::debug!(
                    query = query.id(),
                    level,
                    percentile,
                    observed,
                    rows = aggregate.len(),
                    "Percentile at finest level"
                );
                (threshold, aggregate.filter_admitted(threshold))
            },
            Some(finer) => {
                let name = ctx.namespace().filter_output(query.id(), finer);
                let previous = store.read(&name)?;
                let survivors = aggregate.semi_join(&previous.rekey(level).key_set());
                let threshold = survivors
                    .min_value()
                    .map(|v| Threshold::from_observed(v as f64))
                    .unwrap_or_else(Threshold::floor);
                (threshold, survivors.filter_admitted(threshold))
            },
        };

        let name = ctx.namespace().filter_output(query.id(), level);
        tracing::info!(
            query = query.id(),
            level,
            threshold = threshold.value(),
            admitted = admitted.len(),
            "Calibrated threshold"
        );
        store.write(&name, admitted)?;
        ctx.record(query.id(), level, threshold, name);
        Ok(threshold)
    }
}
