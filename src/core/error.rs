//! Error taxonomy shared by the store, the pool and the orchestrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown task id on an operation that cannot degrade to an empty result.
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    DuplicateTask(String),

    #[error("worker pool has been shut down")]
    PoolShutdown,

    /// A job's work function returned an error or panicked.
    #[error("task {task_id} failed: {message}")]
    WorkerExecution { task_id: String, message: String },

    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("progress {0} is outside 0..=100")]
    InvalidProgress(f64),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
