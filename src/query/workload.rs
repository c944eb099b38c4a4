//! Workloads: origin groups of query instances
//!
//! An origin group is one traced workload. It selects its training packets
//! with a set of predicates, and every query instance of the group runs over
//! that same training relation. A composite query (a join) lives in the same
//! group as its branches, and the branches use the composite as their
//! baseline query when counting cross-level transits.

use std::collections::{BTreeMap, HashSet};

use super::builder::Query;
use super::catalog::StageCatalog;
use super::plan::PartitionPlan;
use crate::error::{Error, Result};
use crate::packet::{PacketPredicate, PacketRecord, PacketTransform};
use crate::relation::Relation;
use crate::types::{OriginId, QueryId, StageId};

/// Query instances sharing one origin's training data
#[derive(Debug, Clone, PartialEq)]
pub struct QueryGroup {
    origin: OriginId,
    predicates: Vec<PacketPredicate>,
    transforms: Vec<PacketTransform>,
    // Dependency order: branches before the composite that joins them
    queries: Vec<Query>,
    plans: BTreeMap<QueryId, PartitionPlan>,
    baselines: BTreeMap<QueryId, QueryId>,
}

impl QueryGroup {
    /// Empty group for `origin`
    pub fn new(origin: OriginId) -> Self {
        Self {
            origin,
            predicates: Vec::new(),
            transforms: Vec::new(),
            queries: Vec::new(),
            plans: BTreeMap::new(),
            baselines: BTreeMap::new(),
        }
    }

    /// Only packets matching `predicate` reach the group's queries
    pub fn with_predicate(mut self, predicate: PacketPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Rewrite selected packets with `transform`
    pub fn with_transform(mut self, transform: PacketTransform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Add a query instance with its partition plan
    ///
    /// Join branches must already be part of the group. A join takes its
    /// refinement field from the left branch.
    pub fn with_query(mut self, mut query: Query, plan: &[StageId]) -> Result<Self> {
        let id = query.id();
        if self.query(id).is_some() {
            return Err(Error::InvalidQuery {
                query: id,
                reason: format!("declared twice in origin {}", self.origin),
            });
        }
        if let Some((left, right, _)) = query.join() {
            for branch in [left, right] {
                if self.query(branch).is_none() {
                    return Err(Error::InvalidQuery {
                        query: id,
                        reason: format!("join branch {} is not declared before it", branch),
                    });
                }
            }
            if let Some(forward) = self.query(left) {
                query.set_refinement(forward.refinement_field());
            }
        }

        let plan = PartitionPlan::new(&query, plan.to_vec())?;
        self.plans.insert(id, plan);
        self.queries.push(query);
        Ok(self)
    }

    /// Use `baseline`'s terminal output as the coarse key set of `query`
    pub fn with_baseline(mut self, query: QueryId, baseline: QueryId) -> Self {
        self.baselines.insert(query, baseline);
        self
    }

    /// Origin id
    pub fn origin(&self) -> OriginId {
        self.origin
    }

    /// Query instances in dependency order
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    /// Query instance by id
    pub fn query(&self, id: QueryId) -> Option<&Query> {
        self.queries.iter().find(|q| q.id() == id)
    }

    /// Partition plan of a query instance
    pub fn plan(&self, id: QueryId) -> Option<&PartitionPlan> {
        self.plans.get(&id)
    }

    /// Baseline query of `id` (itself unless configured otherwise)
    pub fn baseline_of(&self, id: QueryId) -> QueryId {
        self.baselines.get(&id).copied().unwrap_or(id)
    }

    /// Whether a packet belongs to the group's training data
    pub fn selects(&self, packet: &PacketRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(packet))
    }

    /// Select and rewrite the group's training packets
    pub fn training_packets(&self, packets: &[PacketRecord]) -> Vec<PacketRecord> {
        packets
            .iter()
            .filter(|p| self.selects(p))
            .map(|p| {
                let mut p = *p;
                for transform in &self.transforms {
                    transform.apply(&mut p);
                }
                p
            })
            .collect()
    }

    /// Training relation of the group
    pub fn training_relation(&self, packets: &[PacketRecord]) -> Relation {
        Relation::from_packets(&self.training_packets(packets))
    }
}

/// Every origin group of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    groups: Vec<QueryGroup>,
}

impl Workload {
    /// Validate and assemble a workload
    ///
    /// Origin ids and query ids must be unique across groups, and baselines
    /// must name queries of the same group.
    pub fn new(groups: Vec<QueryGroup>) -> Result<Self> {
        let mut origins = HashSet::new();
        let mut ids = HashSet::new();

        for group in &groups {
            if !origins.insert(group.origin) {
                return Err(Error::Configuration(format!(
                    "origin {} declared twice",
                    group.origin
                )));
            }
            for query in &group.queries {
                if !ids.insert(query.id()) {
                    return Err(Error::InvalidQuery {
                        query: query.id(),
                        reason: "declared in more than one origin".to_string(),
                    });
                }
            }
            for (&query, &baseline) in &group.baselines {
                if group.query(query).is_none() || group.query(baseline).is_none() {
                    return Err(Error::InvalidQuery {
                        query,
                        reason: format!(
                            "baseline {} and query must both belong to origin {}",
                            baseline, group.origin
                        ),
                    });
                }
            }
        }

        Ok(Self { groups })
    }

    /// Origin groups
    pub fn groups(&self) -> &[QueryGroup] {
        &self.groups
    }

    /// Group of an origin
    pub fn group(&self, origin: OriginId) -> Option<&QueryGroup> {
        self.groups.iter().find(|g| g.origin == origin)
    }

    /// Group holding query instance `id`
    pub fn group_of(&self, id: QueryId) -> Result<&QueryGroup> {
        self.groups
            .iter()
            .find(|g| g.query(id).is_some())
            .ok_or(Error::UnknownQuery(id))
    }

    /// Query instance by id
    pub fn query(&self, id: QueryId) -> Result<&Query> {
        self.group_of(id)?.query(id).ok_or(Error::UnknownQuery(id))
    }

    /// Partition plan of a query instance
    pub fn plan(&self, id: QueryId) -> Result<&PartitionPlan> {
        self.group_of(id)?.plan(id).ok_or(Error::UnknownQuery(id))
    }

    /// Query instances each origin fans out to
    pub fn origin_instances(&self) -> BTreeMap<OriginId, Vec<QueryId>> {
        self.groups
            .iter()
            .map(|g| (g.origin, g.queries.iter().map(Query::id).collect()))
            .collect()
    }

    /// Operator kinds of every stage in the workload
    pub fn catalog(&self) -> StageCatalog {
        StageCatalog::from_queries(self.groups.iter().flat_map(|g| g.queries.iter()))
    }
}
