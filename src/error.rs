//! Error types for procpool.

use std::time::Duration;
use thiserror::Error;

/// Error returned by pool operations (start, submit, resize, shutdown).
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker startup failed: {}", format_failed(.failed))]
    Startup {
        /// Worker ids that never reached the ready state, with the reason.
        failed: Vec<(usize, String)>,
    },

    #[error("Pool is not running")]
    PoolNotRunning,

    #[error("No free worker slot (submission is bounded)")]
    Backpressure,

    #[error("Invalid pool state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),
}

fn format_failed(failed: &[(usize, String)]) -> String {
    failed
        .iter()
        .map(|(id, reason)| format!("worker {} ({})", id, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Terminal failure of a single job, delivered to its callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The task ran and reported an error.
    #[error("Task failed: {0}")]
    Task(String),

    #[error("Worker {pid} died while running the job: {reason}")]
    WorkerDied { pid: i32, reason: String },

    #[error("Hard time limit ({limit:?}) exceeded")]
    HardTimeout { limit: Duration },

    #[error("Pool terminated before the job finished")]
    PoolTerminated,
}

/// Outcome handed to a job callback.
pub type JobResult = std::result::Result<serde_json::Value, JobError>;

/// Result type alias for procpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
