//! Read-only pool snapshot.

use serde::Serialize;

use super::breaker::BreakerSnapshot;
use crate::worker::{WorkerSnapshot, WorkerStatus};

/// Point-in-time view of the pool, for logging and monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_workers: usize,
    pub ready_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
    pub dead_workers: usize,
    /// Slots being restarted (no live worker behind them yet).
    pub initializing_workers: usize,
    pub queue_length: usize,
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
    pub total_restarts: u64,
    pub circuit_breaker: BreakerSnapshot,
    pub workers: Vec<WorkerSnapshot>,
}

impl PoolStats {
    pub(crate) fn count(workers: &[WorkerSnapshot], status: WorkerStatus) -> usize {
        workers.iter().filter(|w| w.status == status).count()
    }

    /// Look up one worker by id.
    pub fn worker(&self, id: usize) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.id == id)
    }
}
