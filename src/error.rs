//! Error types for workd.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The item is no longer allocated to the worker trying to finish it
    /// (recovered as an orphan, or re-claimed after its lease expired).
    #[error("work item {id} is no longer allocated to worker {worker}")]
    LeaseLost { id: String, worker: String },

    #[error("invalid work item: {0}")]
    InvalidWork(String),

    #[error("invalid schedule '{expr}': {reason}")]
    Schedule { expr: String, reason: String },

    #[error("no adapter registered for work type {0}")]
    UnknownType(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
