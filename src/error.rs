//! Error types for the cost estimation pipeline

use thiserror::Error;

use crate::types::{Level, QueryId, StageId};

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Operator kind lookup for a stage the query never declared
    #[error("Unknown stage {stage} for query {query}")]
    UnknownQueryStage {
        /// Query instance id
        query: QueryId,
        /// Stage id (already reduced modulo 1000)
        stage: StageId,
    },

    /// Query id not present in the workload
    #[error("Unknown query: {0}")]
    UnknownQuery(QueryId),

    /// Partition plan rejected at construction time
    #[error("Invalid partition plan for query {query}: {reason}")]
    InvalidPartitionPlan {
        /// Query the plan belongs to
        query: QueryId,
        /// Why the plan was rejected
        reason: String,
    },

    /// Query definition rejected by the builder or the workload
    #[error("Invalid query {query}: {reason}")]
    InvalidQuery {
        /// Query id
        query: QueryId,
        /// Why the definition was rejected
        reason: String,
    },

    /// A filter was evaluated before its threshold was calibrated
    #[error("No threshold for query {query} at level {level}")]
    MissingThreshold {
        /// Query id
        query: QueryId,
        /// Refinement level
        level: Level,
    },

    /// Checkpoint store error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Raw count artifact could not be named, read or decoded
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// Malformed packet trace line
    #[error("Trace error at line {line}: {message}")]
    Trace {
        /// 1-based line number in the trace file
        line: usize,
        /// Description of the parse failure
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Checkpoint store errors
///
/// Checkpoints are write-once: a relation written under a name is never
/// replaced, and reading a name nobody wrote is an error.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A relation was already written under this name
    #[error("Checkpoint already exists: {0}")]
    AlreadyExists(String),

    /// Nothing was written under this name
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    /// Name would escape the checkpoint directory or is empty
    #[error("Invalid checkpoint name: {0}")]
    InvalidName(String),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding a relation failed
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for CheckpointError {
    fn from(e: bincode::Error) -> Self {
        CheckpointError::Codec(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
