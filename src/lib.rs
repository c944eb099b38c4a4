//! Refinement cost - cost-matrix estimation for telemetry queries
//!
//! Estimates what it costs to evaluate a workload of packet-stream queries
//! on a switch when their keys are refined from coarse to fine IP prefixes:
//! - Threshold calibration per query and refinement level
//! - Transit counting for direct (baseline) and level-to-level evaluation
//! - Assembly of raw counts into a per-minute cost matrix
//! - Pruning of the matrix to a reference set of levels
//!
//! # Pipeline
//!
//! ```text
//! trace ──▶ QueryGroup::training_relation ──▶ ThresholdCalibrator ──▶ ThresholdTable
//!                                                    │                      │
//!                                                    ▼                      ▼
//!                                             CheckpointStore ◀──── TransitCounter
//!                                                                          │
//!                                                                          ▼
//!                     CostMatrix ◀── CostMatrixAssembler ◀── RawCountArtifact
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod packet;
pub mod refinement;
pub mod relation;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Query pipelines, partition plans and the standard workload
pub mod query;

/// Query evaluation and write-once checkpoints
pub mod engine;

/// Per-level filter threshold calibration
pub mod calibration;

/// Transit counting
pub mod transit;

/// Cost matrix, raw count artifacts and assembly
pub mod cost_matrix;

/// End-to-end estimation driver
pub mod estimator;

// Re-export main types
pub use calibration::{ThresholdCalibrator, ThresholdTable};
pub use config::Config;
pub use cost_matrix::{CostMatrix, CostMatrixAssembler, RawCountArtifact};
pub use error::{Error, Result};
pub use estimator::{CostEstimator, MinuteRun};
pub use packet::PacketRecord;
pub use refinement::RefinementHierarchy;
pub use transit::TransitCounter;
pub use types::{CostRecord, Level, MinuteBucket, QueryId, StageId, Threshold, TransitPair};
