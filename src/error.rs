//! Error types for the classifier pool.

use std::time::Duration;

use crate::dispatch::TaskId;
use crate::worker::WorkerId;

/// Top-level error type for the pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Submission rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("Task failed: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Rejections returned synchronously by `Dispatcher::submit`.
///
/// None of these enqueue anything; the caller may retry later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Circuit breaker is open after {failures} consecutive failures, retry in {retry_after:?}")]
    CircuitOpen { failures: u32, retry_after: Duration },

    #[error("Task queue is full ({max} pending)")]
    QueueFull { max: usize },

    #[error("No classifier workers available")]
    NoWorkersAvailable,

    #[error("Pool is shutting down")]
    ShuttingDown,
}

/// Failures delivered through a task's outcome.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: TaskId, timeout: Duration },

    #[error("Failed to write request to worker {worker_id}: {reason}")]
    Write { worker_id: WorkerId, reason: String },

    #[error("Malformed response from worker {worker_id}: {reason}")]
    MalformedResponse { worker_id: WorkerId, reason: String },

    #[error("Worker {worker_id} exited (code {code:?}) before responding")]
    WorkerExited {
        worker_id: WorkerId,
        code: Option<i32>,
    },

    #[error("Worker {worker_id} was restarted before responding")]
    WorkerRestarted { worker_id: WorkerId },

    #[error("Classifier error: {message}")]
    Classifier { message: String },

    #[error("Task {task_id} was dropped by the pool without a result")]
    Abandoned { task_id: TaskId },
}

/// Worker lifecycle and pool startup errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn worker {worker_id}: {reason}")]
    Spawn { worker_id: WorkerId, reason: String },

    #[error("Worker {worker_id} did not signal READY within {timeout:?}")]
    WorkerStartupTimeout {
        worker_id: WorkerId,
        timeout: Duration,
    },

    #[error("Worker {worker_id} exited (code {code:?}) before signalling READY")]
    WorkerExitedDuringStartup {
        worker_id: WorkerId,
        code: Option<i32>,
    },

    #[error("Pool initialization failed at worker {worker_id}: {source}")]
    InitializationFailed {
        worker_id: WorkerId,
        #[source]
        source: Box<PoolError>,
    },

    #[error("Worker {worker_id} not found")]
    WorkerNotFound { worker_id: WorkerId },

    #[error("Worker {worker_id} is already restarting")]
    RestartInProgress { worker_id: WorkerId },

    #[error("Pool is shutting down")]
    ShuttingDown,
}

/// Result type alias for the pool.
pub type Result<T> = std::result::Result<T, Error>;
