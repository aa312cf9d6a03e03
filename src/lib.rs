//! Classifier Pool: long-lived email classifier processes behind a
//! bounded queue.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod worker;

pub use config::{BreakerConfig, ClassifierCommand, PoolConfig};
pub use dispatch::{Dispatcher, PendingClassification, PoolStats};
pub use error::{ConfigError, Error, PoolError, SubmitError, TaskError};
pub use worker::{ClassificationRequest, ClassificationResult, WorkerId, WorkerStatus};
