//! Query execution and intermediate storage

pub mod checkpoint;
pub mod evaluator;

pub use checkpoint::{CheckpointNamespace, CheckpointStore, DiskCheckpointStore, MemoryCheckpointStore};
pub use evaluator::Evaluator;
