//! Partition plans
//!
//! A partition plan lists the stages at which a query's intermediate output
//! is materialized and counted. Plans are checked once, when they are built,
//! so everything downstream can index stages without re-validating.

use serde::{Deserialize, Serialize};

use super::builder::Query;
use super::stage::OperatorKind;
use crate::error::{Error, Result};
use crate::types::{QueryId, StageId};

/// Validated partition plan of one query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    query: QueryId,
    stages: Vec<StageId>,
}

impl PartitionPlan {
    /// Validate `stages` against `query`
    ///
    /// The plan must be non-empty and strictly ascending, every id must be
    /// the packet source (0) or a declared stage, and the last id must be the
    /// query's terminal stage. Join queries have no packet source of their
    /// own, so 0 is rejected for them.
    pub fn new(query: &Query, stages: Vec<StageId>) -> Result<Self> {
        let qid = query.id();
        let invalid = |reason: String| Error::InvalidPartitionPlan { query: qid, reason };

        let Some(&last) = stages.last() else {
            return Err(invalid("plan is empty".to_string()));
        };
        if let Some(w) = stages.windows(2).find(|w| w[0] >= w[1]) {
            return Err(invalid(format!(
                "stage ids must be strictly ascending, found {} before {}",
                w[0], w[1]
            )));
        }

        let is_join = query
            .stage(1)
            .map(|s| s.kind() == OperatorKind::Join)
            .unwrap_or(false);
        for &id in &stages {
            if id == 0 {
                if is_join {
                    return Err(invalid("join queries cannot partition at the packet source".to_string()));
                }
                continue;
            }
            if query.stage(id).is_none() {
                return Err(invalid(format!("stage {} is not declared", id)));
            }
        }

        if last != query.terminal_id() {
            return Err(invalid(format!(
                "last stage {} is not the terminal stage {}",
                last,
                query.terminal_id()
            )));
        }

        Ok(Self { query: qid, stages })
    }

    /// Query the plan belongs to
    pub fn query(&self) -> QueryId {
        self.query
    }

    /// Partition stage ids, ascending
    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// The terminal stage
    pub fn terminal(&self) -> StageId {
        // Non-empty by construction
        self.stages[self.stages.len() - 1]
    }

    /// Whether the plan materializes `stage`
    pub fn contains(&self, stage: StageId) -> bool {
        self.stages.binary_search(&stage).is_ok()
    }
}
