//! Typed query builder
//!
//! Queries are composed from stage descriptors with a fluent builder; each
//! call appends one stage and [`PacketStream::build`] validates the chain.
//!
//! # Example
//!
//! ```rust
//! use refinement_cost::packet::Field;
//! use refinement_cost::query::{OperatorKind, PacketStream};
//! use refinement_cost::relation::MapValue;
//!
//! // New TCP connections per destination
//! let query = PacketStream::new(2)
//!     .map(&[Field::DstIp], MapValue::One)
//!     .reduce(&[Field::DstIp])
//!     .filter(99.9)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(query.terminal_id(), 3);
//! assert_eq!(query.stage(2).unwrap().kind(), OperatorKind::Reduce);
//! assert_eq!(query.percentile(), Some(99.9));
//! ```

use serde::{Deserialize, Serialize};

use super::stage::{Admission, Combinator, OperatorKind, Stage, StageOp};
use crate::error::{Error, Result};
use crate::packet::Field;
use crate::relation::MapValue;
use crate::types::{QueryId, StageId};

/// A validated query pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    id: QueryId,
    refinement: Field,
    stages: Vec<Stage>,
}

impl Query {
    /// Query id
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// Address field masked at each refinement level
    pub fn refinement_field(&self) -> Field {
        self.refinement
    }

    /// Stages in pipeline order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stage by id
    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        id.checked_sub(1)
            .and_then(|idx| self.stages.get(idx as usize))
    }

    /// Id of the last stage
    pub fn terminal_id(&self) -> StageId {
        self.stages.len() as StageId
    }

    /// The admission filter, if the query has one
    pub fn filter_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind() == OperatorKind::Filter)
    }

    /// Percentile declared on the filter stage
    pub fn percentile(&self) -> Option<f64> {
        self.filter_stage().and_then(|s| match s.op {
            StageOp::Filter { percentile } => Some(percentile),
            _ => None,
        })
    }

    /// Whether thresholds must be calibrated for this query
    pub fn is_calibrated(&self) -> bool {
        self.filter_stage().is_some()
    }

    /// Branches and combinator, for join queries
    pub fn join(&self) -> Option<(QueryId, QueryId, Combinator)> {
        self.stages.iter().find_map(|s| match s.op {
            StageOp::Join {
                left,
                right,
                combinator,
                ..
            } => Some((left, right, combinator)),
            _ => None,
        })
    }

    /// How a join admits rows of its left branch
    pub fn left_admission(&self) -> Option<Admission> {
        self.stages.iter().find_map(|s| match s.op {
            StageOp::Join { left_admission, .. } => Some(left_admission),
            _ => None,
        })
    }

    pub(crate) fn set_refinement(&mut self, field: Field) {
        self.refinement = field;
    }
}

/// Builder for packet-stream queries
#[derive(Debug, Clone)]
pub struct PacketStream {
    id: QueryId,
    refinement: Option<Field>,
    ops: Vec<StageOp>,
    // First misuse seen while chaining, reported by build()
    error: Option<String>,
}

impl PacketStream {
    /// Start a query over the packet source
    pub fn new(id: QueryId) -> Self {
        Self {
            id,
            refinement: None,
            ops: Vec::new(),
            error: None,
        }
    }

    /// Start a query that joins two other queries of the same group
    pub fn join(id: QueryId, left: QueryId, right: QueryId, combinator: Combinator) -> Self {
        Self {
            id,
            refinement: None,
            ops: vec![StageOp::Join {
                left,
                right,
                combinator,
                left_admission: Admission::AtLeast,
            }],
            error: None,
        }
    }

    /// Take only forward rows strictly above the left branch's threshold
    ///
    /// Only meaningful on a join; the branch queried on its own still
    /// admits rows at its threshold.
    pub fn above_left_threshold(mut self) -> Self {
        match self.ops.first_mut() {
            Some(StageOp::Join { left_admission, .. }) => *left_admission = Admission::Above,
            _ => {
                if self.error.is_none() {
                    self.error = Some("strict left admission needs a join".to_string());
                }
            },
        }
        self
    }

    /// Refine on `field` instead of the first address field of the first map
    ///
    /// Joins always refine on their left branch's field.
    pub fn refine_on(mut self, field: Field) -> Self {
        self.refinement = Some(field);
        self
    }

    /// Project onto `keys`
    pub fn map(mut self, keys: &[Field], value: MapValue) -> Self {
        self.ops.push(StageOp::Map {
            keys: keys.to_vec(),
            value,
        });
        self
    }

    /// Deduplicate on `keys` (must be the current key)
    pub fn distinct(mut self, keys: &[Field]) -> Self {
        self.check_aggregation_keys(keys);
        self.ops.push(StageOp::Distinct);
        self
    }

    /// Sum values per `keys` (must be the current key)
    pub fn reduce(mut self, keys: &[Field]) -> Self {
        self.check_aggregation_keys(keys);
        self.ops.push(StageOp::Reduce);
        self
    }

    fn check_aggregation_keys(&mut self, keys: &[Field]) {
        if self.error.is_some() {
            return;
        }
        let current = self.ops.iter().rev().find_map(|op| match op {
            StageOp::Map { keys, .. } => Some(Some(keys)),
            // After a join the key is only known at run time
            StageOp::Join { .. } => Some(None),
            _ => None,
        });
        match current {
            Some(Some(current)) if current.as_slice() != keys => {
                self.error = Some(format!(
                    "aggregation keys {:?} differ from the current key {:?}",
                    keys, current
                ));
            },
            None => {
                self.error = Some("aggregation must follow a map or a join".to_string());
            },
            _ => {},
        }
    }

    /// Admit rows at or above the threshold calibrated from `percentile`
    pub fn filter(mut self, percentile: f64) -> Self {
        self.ops.push(StageOp::Filter { percentile });
        self
    }

    /// Validate and number the stages
    pub fn build(self) -> Result<Query> {
        let id = self.id;
        let invalid = |reason: String| Error::InvalidQuery { query: id, reason };

        if let Some(reason) = self.error {
            return Err(invalid(reason));
        }
        let ops = self.ops;
        if ops.is_empty() {
            return Err(invalid("query has no stages".to_string()));
        }

        // None once the key comes from a join and is not known here
        let mut current: Option<Vec<Field>> = Some(Field::ALL.to_vec());
        let mut filters = 0;

        for (idx, op) in ops.iter().enumerate() {
            match op {
                StageOp::Map { keys, value } => {
                    if keys.is_empty() {
                        return Err(invalid(format!("stage {} maps onto no keys", idx + 1)));
                    }
                    if let Some(cur) = &current {
                        let mut needed = keys.clone();
                        if let MapValue::Field(f) = value {
                            needed.push(*f);
                        }
                        if let Some(missing) = needed.iter().find(|f| !cur.contains(f)) {
                            return Err(invalid(format!(
                                "stage {} reads {} which the input key does not carry",
                                idx + 1,
                                missing
                            )));
                        }
                    }
                    current = Some(keys.clone());
                },
                StageOp::Distinct | StageOp::Reduce => {
                    if idx == 0 {
                        return Err(invalid("pipeline cannot start with an aggregation".to_string()));
                    }
                },
                StageOp::Filter { percentile } => {
                    if idx == 0 {
                        return Err(invalid("pipeline cannot start with a filter".to_string()));
                    }
                    if !(*percentile > 0.0 && *percentile <= 100.0) {
                        return Err(invalid(format!("percentile {} not in (0, 100]", percentile)));
                    }
                    filters += 1;
                },
                StageOp::Join { left, right, .. } => {
                    if idx != 0 {
                        return Err(invalid("join must be the first stage".to_string()));
                    }
                    if *left == id || *right == id {
                        return Err(invalid("query cannot join itself".to_string()));
                    }
                    current = None;
                },
            }
        }
        if filters > 1 {
            return Err(invalid("at most one filter stage is supported".to_string()));
        }

        let is_join = matches!(ops.first(), Some(StageOp::Join { .. }));
        let refinement = match self.refinement {
            Some(_) if is_join => {
                return Err(invalid("a join refines on its left branch".to_string()));
            },
            Some(field) if field.is_address() => field,
            Some(field) => {
                return Err(invalid(format!("cannot refine on non-address field {}", field)));
            },
            None => first_address_field(&ops).ok_or_else(|| {
                invalid("no address field to refine on".to_string())
            })?,
        };

        let stages = ops
            .into_iter()
            .enumerate()
            .map(|(idx, op)| Stage {
                id: idx as StageId + 1,
                op,
            })
            .collect();

        Ok(Query {
            id,
            refinement,
            stages,
        })
    }
}

// A join's field is provisional until QueryGroup::with_query copies it from
// the left branch.
fn first_address_field(ops: &[StageOp]) -> Option<Field> {
    match ops.first() {
        Some(StageOp::Map { keys, .. }) => keys.iter().copied().find(Field::is_address),
        Some(StageOp::Join { .. }) => Some(Field::DstIp),
        _ => None,
    }
}
