//! Classifier workers: one long-lived external process each.
//!
//! Core components:
//! - `protocol`: request/response lines and the READY sentinel
//! - `process`: child process handle with line framing
//! - `state`: worker status machine (Initializing → Ready ⇄ Busy → Error/Dead)
//! - `worker`: status, counters and readiness handshake around a process

pub mod process;
pub mod protocol;
pub mod state;
pub mod worker;

/// Stable worker identity within one pool.
pub type WorkerId = usize;

pub use process::{ProcessEvent, WorkerProcess};
pub use protocol::{ClassificationRequest, ClassificationResult, WorkerReply};
pub use state::WorkerStatus;
pub use worker::{Worker, WorkerSnapshot};
