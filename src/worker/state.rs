//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Process spawned, waiting for the READY sentinel.
    Initializing,
    /// Idle and accepting tasks.
    Ready,
    /// Exactly one task in flight.
    Busy,
    /// Last task failed; no new tasks until restarted.
    Error,
    /// Process exited.
    Dead,
}

impl WorkerStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Leaving `Error` or `Dead` is not a transition: the restart path
    /// replaces the worker with a fresh one under the same id.
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        matches!(
            (self, target),
            // From Initializing
            (Initializing, Ready) | (Initializing, Dead) |
            // From Ready
            (Ready, Busy) | (Ready, Dead) |
            // From Busy
            (Busy, Ready) | (Busy, Error) | (Busy, Dead) |
            // From Error
            (Error, Dead)
        )
    }

    /// Whether a worker in this status counts as pool capacity.
    pub fn has_capacity(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether the worker can take a task right now.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}
