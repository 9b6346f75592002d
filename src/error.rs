//! Error taxonomy for the instance engine.
//!
//! Mirrors the eight abstract error kinds of the design: each becomes a
//! `snafu` variant carrying whatever context is needed to log it with full
//! detail. Nothing here is fatal to a worker loop — callers log and
//! continue per the error handling policy.

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("instance {task_id}/{instance_id} failed to initialize: {reason}"))]
    InitFailure {
        task_id: String,
        instance_id: String,
        reason: String,
    },

    #[snafu(display("source for {task_id}/{instance_id} was deleted"))]
    SourceDeleted { task_id: String, instance_id: String },

    #[snafu(display("backpressure: pool {pool} has no room for {requested} bytes"))]
    BackpressureTransient { pool: String, requested: u64 },

    #[snafu(display("action queue full, dropped {action_kind} for {instance_id}"))]
    QueueFull {
        action_kind: String,
        instance_id: String,
    },

    #[snafu(display("transport error for {task_id}/{instance_id}: {source}"))]
    TransportRetryable {
        task_id: String,
        instance_id: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("store corruption reading key {key}: {reason}"))]
    StoreCorruption { key: String, reason: String },

    #[snafu(display("invalid state for {task_id}/{instance_id}: {reason}"))]
    InvalidState {
        task_id: String,
        instance_id: String,
        reason: String,
    },

    #[snafu(display("fatal: {reason}"))]
    Fatal { reason: String },

    #[snafu(display("unknown source tag {tag}"))]
    UnknownSourceTag { tag: String },

    #[snafu(display("unknown sink tag {tag}"))]
    UnknownSinkTag { tag: String },

    #[snafu(display("store I/O error: {source}"))]
    Sled { source: sled::Error },

    #[snafu(display("serialization error: {source}"))]
    Serde { source: serde_json::Error },
}

impl From<sled::Error> for EngineError {
    fn from(source: sled::Error) -> Self {
        EngineError::Sled { source }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(source: serde_json::Error) -> Self {
        EngineError::Serde { source }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
