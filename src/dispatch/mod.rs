//! Task dispatch: queueing, matching and failure isolation.
//!
//! - `queue`: bounded FIFO of submitted tasks and their outcome futures
//! - `breaker`: consecutive-failure circuit breaker gating submissions
//! - `dispatcher`: owns the workers and routes responses back to tasks
//! - `stats`: read-only pool snapshot

pub mod breaker;
pub mod dispatcher;
pub mod queue;
pub mod stats;

/// Monotonic task identity, unique per pool.
pub type TaskId = u64;

pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use dispatcher::Dispatcher;
pub use queue::{PendingClassification, Task, TaskOutcome, TaskQueue};
pub use stats::PoolStats;
