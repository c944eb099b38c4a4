//! Query pipelines
//!
//! Queries are typed chains of stage descriptors built with [`PacketStream`].
//! Each stage carries its [`OperatorKind`], so pricing a stage is a lookup in
//! the [`StageCatalog`] derived from the queries themselves.
//!
//! # Architecture
//!
//! ```text
//! PacketStream ──build()──▶ Query ──┬──▶ PartitionPlan   (stages to count)
//!                                   ├──▶ StageCatalog    (stage → kind)
//!                                   └──▶ QueryGroup ──▶ Workload
//!                                          (origin, predicates, baselines)
//! ```
//!
//! Stage 0 is the packet source; declared stages are numbered from 1.

pub mod builder;
pub mod catalog;
pub mod plan;
pub mod stage;
pub mod standard;
pub mod workload;

pub use builder::{PacketStream, Query};
pub use catalog::StageCatalog;
pub use plan::PartitionPlan;
pub use stage::{Admission, Combinator, OperatorKind, Stage, StageOp};
pub use standard::standard_workload;
pub use workload::{QueryGroup, Workload};
