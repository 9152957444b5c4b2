//! Error types for taskroom.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A task type was popped that no registry entry knows about. This is a
    /// deploy-order bug, not a data error.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("unable to decode {task_type} payload: {source}")]
    Decode {
        task_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("task {task_type} timed out after {timeout:?}")]
    TaskTimeout { task_type: String, timeout: Duration },

    /// The user supplied a query the search collaborator could not parse.
    #[error("invalid contact query: {0}")]
    Query(String),

    /// The campaign event or its flow is no longer active.
    #[error("flow or campaign no longer active: {0}")]
    FlowInactive(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),

    #[error("flow engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// User-input failures are reported on the affected object rather than
    /// escalated as operational errors.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::Query(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
