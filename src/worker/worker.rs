//! A supervised classifier worker.
//!
//! Pairs one [`WorkerProcess`] with its lifecycle status and usage counters.
//! The dispatcher owns every `Worker`; nothing else touches the process.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::WorkerId;
use super::process::{ProcessEvent, WorkerProcess};
use super::protocol::is_ready_line;
use super::state::WorkerStatus;
use crate::config::PoolConfig;
use crate::error::PoolError;

/// One managed classifier process plus its lifecycle state.
pub struct Worker {
    id: WorkerId,
    /// Distinguishes successive processes behind the same id.
    incarnation: u64,
    status: WorkerStatus,
    tasks_completed: u64,
    started_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    process: WorkerProcess,
}

/// Read-only view of a worker for stats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub tasks_completed: u64,
    pub started_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

impl Worker {
    /// Spawn a classifier and wait for its READY line.
    ///
    /// Output before READY (import warnings, banners) is logged and skipped.
    /// Returns the ready worker and the rest of its event stream.
    pub async fn start(
        id: WorkerId,
        incarnation: u64,
        config: &PoolConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), PoolError> {
        let (process, mut events) = WorkerProcess::spawn(id, &config.command)?;
        let mut worker = Self {
            id,
            incarnation,
            status: WorkerStatus::Initializing,
            tasks_completed: 0,
            started_at: Utc::now(),
            last_used_at: None,
            process,
        };

        let handshake = tokio::time::timeout(config.startup_timeout, async {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Line(line) if is_ready_line(&line) => return Ok(()),
                    ProcessEvent::Line(line) => {
                        debug!(worker_id = id, line = %line.chars().take(200).collect::<String>(), "Classifier output before READY");
                    }
                    ProcessEvent::IoError(reason) => {
                        warn!(worker_id = id, reason = %reason, "I/O error during classifier startup");
                    }
                    ProcessEvent::Exited(code) => {
                        return Err(PoolError::WorkerExitedDuringStartup { worker_id: id, code });
                    }
                }
            }
            Err(PoolError::WorkerExitedDuringStartup {
                worker_id: id,
                code: None,
            })
        })
        .await;

        match handshake {
            Ok(Ok(())) => {
                worker.transition_to(WorkerStatus::Ready);
                info!(
                    worker_id = id,
                    pid = ?worker.process.pid(),
                    startup_ms = (Utc::now() - worker.started_at).num_milliseconds(),
                    "Classifier worker ready"
                );
                Ok((worker, events))
            }
            Ok(Err(e)) => {
                warn!(worker_id = id, error = %e, "Classifier worker failed to start");
                Err(e)
            }
            Err(_) => {
                warn!(
                    worker_id = id,
                    timeout_secs = config.startup_timeout.as_secs_f64(),
                    "Classifier worker startup timed out"
                );
                worker.process.terminate(Duration::ZERO).await;
                Err(PoolError::WorkerStartupTimeout {
                    worker_id: id,
                    timeout: config.startup_timeout,
                })
            }
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    /// True exactly while a task is in flight.
    pub fn is_busy(&self) -> bool {
        self.status == WorkerStatus::Busy
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.last_used_at
    }

    /// Move to a new status, logging (and refusing) illegal transitions.
    fn transition_to(&mut self, target: WorkerStatus) -> bool {
        if !self.status.can_transition_to(target) {
            warn!(
                worker_id = self.id,
                from = %self.status,
                to = %target,
                "Ignoring invalid worker transition"
            );
            return false;
        }
        debug!(worker_id = self.id, from = %self.status, to = %target, "Worker transition");
        self.status = target;
        true
    }

    /// Hand a request line to the process and mark the worker busy.
    ///
    /// On a closed stdin the worker goes to `Error` and the reason is returned.
    pub fn assign(&mut self, line: String) -> Result<(), String> {
        if !self.transition_to(WorkerStatus::Busy) {
            return Err(format!("worker is {}", self.status));
        }
        self.last_used_at = Some(Utc::now());
        self.process.send(line).map_err(|e| {
            self.transition_to(WorkerStatus::Error);
            e.to_string()
        })
    }

    /// The in-flight task got a response; back to `Ready`.
    ///
    /// `counts` is false for responses that should not age the worker.
    pub fn finish(&mut self, counts: bool) {
        if self.transition_to(WorkerStatus::Ready) && counts {
            self.tasks_completed += 1;
        }
    }

    /// The in-flight task failed; the worker takes no more tasks.
    pub fn fail(&mut self) {
        self.transition_to(WorkerStatus::Error);
    }

    /// The process has exited.
    pub fn mark_dead(&mut self) {
        if self.status != WorkerStatus::Dead {
            self.transition_to(WorkerStatus::Dead);
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            status: self.status,
            tasks_completed: self.tasks_completed,
            started_at: self.started_at,
            last_used_at: self.last_used_at,
            pid: self.process.pid(),
        }
    }

    /// Stop the process: close stdin, then SIGTERM, then kill, waiting up to
    /// `grace` before each escalation.
    pub async fn terminate(self, grace: Duration) -> Option<i32> {
        let id = self.id;
        let code = self.process.terminate(grace).await;
        debug!(worker_id = id, code = ?code, "Classifier worker terminated");
        code
    }
}
