//! Stage evaluator
//!
//! Runs a query's stages, in order, over the training relation of its origin
//! group at one refinement level. Filters read their cutoff from a
//! [`ThresholdTable`]; joins evaluate both branches to their terminal stage
//! first, so a branch's own filter is applied before the branches meet.

use crate::calibration::ThresholdTable;
use crate::error::{Error, Result};
use crate::query::{Admission, Query, QueryGroup, StageOp};
use crate::relation::{ParallelConfig, Relation};
use crate::types::{Level, QueryId, StageId};

/// Evaluates queries of one origin group
#[derive(Debug, Clone, Copy)]
pub struct Evaluator<'a> {
    group: &'a QueryGroup,
    source: &'a Relation,
    parallel: ParallelConfig,
}

impl<'a> Evaluator<'a> {
    /// Evaluator over `source`, the group's training relation
    pub fn new(group: &'a QueryGroup, source: &'a Relation, parallel: ParallelConfig) -> Self {
        Self {
            group,
            source,
            parallel,
        }
    }

    /// The group whose queries are evaluated
    pub fn group(&self) -> &'a QueryGroup {
        self.group
    }

    /// Output of `query` after stage `upto` at `level`
    ///
    /// Stage 0 is the packet source seen through the query's first map, so it
    /// evaluates the same as stage 1.
    pub fn evaluate(
        &self,
        query: &Query,
        level: Level,
        upto: StageId,
        thresholds: &ThresholdTable,
    ) -> Result<Relation> {
        self.evaluate_with(query, level, upto, thresholds, Admission::AtLeast)
    }

    fn evaluate_with(
        &self,
        query: &Query,
        level: Level,
        upto: StageId,
        thresholds: &ThresholdTable,
        admission: Admission,
    ) -> Result<Relation> {
        let upto = upto.max(1);
        if query.stage(upto).is_none() {
            return Err(Error::UnknownQueryStage {
                query: query.id(),
                stage: upto,
            });
        }

        let mut current: Option<Relation> = None;
        for stage in &query.stages()[..upto as usize] {
            let input = current.as_ref().unwrap_or(self.source);
            let next = match &stage.op {
                StageOp::Map { keys, value } => {
                    input.project(keys, *value, Some(query.refinement_field()), level)?
                },
                StageOp::Distinct => input.distinct(),
                StageOp::Reduce => input.reduce_by_key(self.parallel),
                StageOp::Filter { .. } => {
                    let threshold = thresholds.get(query.id(), level).ok_or(Error::MissingThreshold {
                        query: query.id(),
                        level,
                    })?;
                    admission.apply(input, threshold)
                },
                StageOp::Join {
                    left,
                    right,
                    combinator,
                    left_admission,
                } => {
                    let forward = self.evaluate_branch(*left, level, thresholds, *left_admission)?;
                    let reverse = self.evaluate_terminal(*right, level, thresholds)?;
                    forward.left_outer_join(&reverse, |f, r| combinator.apply(f, r))
                },
            };
            tracing::trace!(
                query = query.id(),
                level,
                stage = stage.id,
                rows = next.len(),
                "Evaluated stage"
            );
            current = Some(next);
        }

        // upto >= 1 and the stage exists, so at least one stage ran
        current.ok_or(Error::UnknownQueryStage {
            query: query.id(),
            stage: upto,
        })
    }

    /// Terminal output of the group's query `id`
    pub fn evaluate_terminal(
        &self,
        id: QueryId,
        level: Level,
        thresholds: &ThresholdTable,
    ) -> Result<Relation> {
        self.evaluate_branch(id, level, thresholds, Admission::AtLeast)
    }

    fn evaluate_branch(
        &self,
        id: QueryId,
        level: Level,
        thresholds: &ThresholdTable,
        admission: Admission,
    ) -> Result<Relation> {
        let query = self.group.query(id).ok_or(Error::UnknownQuery(id))?;
        self.evaluate_with(query, level, query.terminal_id(), thresholds, admission)
    }
}
