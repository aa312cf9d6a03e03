//! Bounded FIFO of classification tasks awaiting a worker.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use super::TaskId;
use crate::error::TaskError;
use crate::worker::{ClassificationRequest, ClassificationResult};

/// Final outcome of one task.
pub type TaskOutcome = Result<ClassificationResult, TaskError>;

/// One submitted classification request.
///
/// Resolving consumes the task, so an outcome is delivered at most once.
/// A task dropped without resolving surfaces as [`TaskError::Abandoned`].
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    request: ClassificationRequest,
    submitted_at: DateTime<Utc>,
    enqueued: Instant,
    outcome: oneshot::Sender<TaskOutcome>,
}

impl Task {
    /// Create a task and the handle its submitter awaits.
    pub fn new(id: TaskId, request: ClassificationRequest) -> (Self, PendingClassification) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            id,
            request,
            submitted_at: Utc::now(),
            enqueued: Instant::now(),
            outcome: tx,
        };
        (task, PendingClassification { task_id: id, rx })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn request(&self) -> &ClassificationRequest {
        &self.request
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Time since submission.
    pub fn waited(&self) -> std::time::Duration {
        self.enqueued.elapsed()
    }

    /// Deliver the outcome. Returns false if the submitter stopped waiting.
    pub fn resolve(self, outcome: TaskOutcome) -> bool {
        self.outcome.send(outcome).is_ok()
    }
}

/// Future for a submitted task's outcome.
#[derive(Debug)]
pub struct PendingClassification {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl PendingClassification {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for PendingClassification {
    type Output = TaskOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let task_id = this.task_id;
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Abandoned { task_id })))
    }
}

/// FIFO of pending tasks with a hard length limit.
#[derive(Debug)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    max_len: usize,
}

impl TaskQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            max_len,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= self.max_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Append to the tail. A full queue hands the task back untouched.
    pub fn push(&mut self, task: Task) -> Result<(), Task> {
        if self.is_full() {
            return Err(task);
        }
        self.tasks.push_back(task);
        Ok(())
    }

    /// Take the oldest task.
    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Remove every task, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }
}
