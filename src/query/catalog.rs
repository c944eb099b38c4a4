//! Operator-kind catalog
//!
//! Maps `(query instance, local stage id)` to the operator kind of that stage.
//! The catalog is derived from the query definitions themselves, so it cannot
//! drift from what the evaluator runs.

use std::collections::BTreeMap;

use super::builder::Query;
use super::stage::OperatorKind;
use crate::error::{Error, Result};
use crate::types::{local_stage_id, QueryId, StageId};

/// Operator kind of every declared stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCatalog {
    kinds: BTreeMap<(QueryId, StageId), OperatorKind>,
}

impl StageCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the given queries
    pub fn from_queries<'a, I>(queries: I) -> Self
    where
        I: IntoIterator<Item = &'a Query>,
    {
        let mut catalog = Self::new();
        for query in queries {
            catalog.register(query);
        }
        catalog
    }

    /// Record every stage of `query`
    pub fn register(&mut self, query: &Query) {
        for stage in query.stages() {
            self.kinds.insert((query.id(), stage.id), stage.kind());
        }
    }

    /// Operator kind of `stage` in `query`
    ///
    /// Instance prefixes are stripped from the stage id first.
    pub fn kind(&self, query: QueryId, stage: StageId) -> Result<OperatorKind> {
        let stage = local_stage_id(stage);
        self.kinds
            .get(&(query, stage))
            .copied()
            .ok_or(Error::UnknownQueryStage { query, stage })
    }

    /// Whether `query` declares `stage`
    pub fn contains(&self, query: QueryId, stage: StageId) -> bool {
        self.kinds.contains_key(&(query, local_stage_id(stage)))
    }

    /// Number of catalogued stages
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether nothing was registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
