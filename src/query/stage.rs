//! Stage descriptors
//!
//! A query is an ordered list of stages. Each stage carries its operator
//! kind directly, so cost assembly never has to branch on strings or side
//! tables to decide how a stage is priced.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::packet::Field;
use crate::relation::{MapValue, Relation};
use crate::types::{QueryId, StageId, Threshold};

/// Operator kind of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    /// Re-key rows, computing a new value
    Map,
    /// Sum values per key (stateful: 32 bits per row)
    Reduce,
    /// Keep one row per key (stateful: 1 bit per row)
    Distinct,
    /// Admit rows at or above the calibrated threshold
    Filter,
    /// Combine two queries on their keys
    Join,
}

impl OperatorKind {
    /// State bits kept per output row, for stateful operators
    pub fn bits_per_row(&self) -> Option<u64> {
        match self {
            OperatorKind::Reduce => Some(32),
            OperatorKind::Distinct => Some(1),
            _ => None,
        }
    }

    /// Whether the operator keeps per-key state
    pub fn is_stateful(&self) -> bool {
        self.bits_per_row().is_some()
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Map => "Map",
            OperatorKind::Reduce => "Reduce",
            OperatorKind::Distinct => "Distinct",
            OperatorKind::Filter => "Filter",
            OperatorKind::Join => "Join",
        };
        f.write_str(name)
    }
}

/// How the two branches of a join are combined per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combinator {
    /// `forward - 2 * reverse`, surfacing directional asymmetry
    Diff,
    /// `forward + reverse`
    Sum,
}

impl Combinator {
    /// Combine a forward value with an optional reverse value
    ///
    /// A missing reverse side passes the forward value through unchanged.
    pub fn apply(&self, forward: i64, reverse: Option<i64>) -> i64 {
        match (self, reverse) {
            (_, None) => forward,
            (Combinator::Diff, Some(r)) => forward - 2 * r,
            (Combinator::Sum, Some(r)) => forward + r,
        }
    }
}

/// How a join reads the filter of its forward branch
///
/// A standalone query admits rows at or above its threshold. Some joins
/// only take forward rows strictly above it, so the mode is carried on
/// the join rather than on the branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    /// `value >= threshold`
    #[default]
    AtLeast,
    /// `value > threshold`
    Above,
}

impl Admission {
    /// Keep the rows of `input` that pass `threshold` under this mode
    pub fn apply(&self, input: &Relation, threshold: Threshold) -> Relation {
        match self {
            Admission::AtLeast => input.filter_admitted(threshold),
            Admission::Above => input.filter_above(threshold),
        }
    }
}

/// What a stage does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageOp {
    /// Project onto `keys`, computing `value`
    Map {
        /// Output key fields
        keys: Vec<Field>,
        /// Output value
        value: MapValue,
    },
    /// Deduplicate keys
    Distinct,
    /// Sum values per key
    Reduce,
    /// Admit rows whose value reaches the calibrated threshold
    Filter {
        /// Percentile of the pre-filter distribution used at the finest level
        percentile: f64,
    },
    /// Left-outer join of two queries' terminal outputs
    Join {
        /// Forward branch
        left: QueryId,
        /// Reverse branch
        right: QueryId,
        /// How matched values are combined
        combinator: Combinator,
        /// How the forward branch's filter admits rows
        #[serde(default)]
        left_admission: Admission,
    },
}

/// One step of a query pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the pipeline (1-based; 0 is the packet source)
    pub id: StageId,
    /// Operation
    pub op: StageOp,
}

impl Stage {
    /// Operator kind
    pub fn kind(&self) -> OperatorKind {
        match self.op {
            StageOp::Map { .. } => OperatorKind::Map,
            StageOp::Distinct => OperatorKind::Distinct,
            StageOp::Reduce => OperatorKind::Reduce,
            StageOp::Filter { .. } => OperatorKind::Filter,
            StageOp::Join { .. } => OperatorKind::Join,
        }
    }
}
