//! Dispatcher: the pool manager.
//!
//! Owns every worker, the task queue and the circuit breaker behind a single
//! lock. Three kinds of activity mutate that state:
//! - callers, through `submit`;
//! - the matching loop, which wakes on a fixed interval and pairs the oldest
//!   queued task with the lowest-id ready worker;
//! - per-worker event pumps and per-task timers, which resolve tasks as
//!   responses, exits and deadlines arrive.
//!
//! Background tasks hold only a `Weak` reference, so dropping the last
//! `Dispatcher` tears the pool down even without `shutdown()`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::TaskId;
use super::breaker::CircuitBreaker;
use super::queue::{PendingClassification, Task, TaskQueue};
use super::stats::PoolStats;
use crate::config::PoolConfig;
use crate::error::{PoolError, SubmitError, TaskError};
use crate::worker::protocol::{is_ready_line, parse_reply};
use crate::worker::{
    ClassificationRequest, ClassificationResult, ProcessEvent, Worker, WorkerId, WorkerReply,
    WorkerStatus,
};

/// Handle to a running classifier pool. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    next_task_id: AtomicU64,
    next_incarnation: AtomicU64,
    shutting_down: AtomicBool,
}

struct PoolState {
    workers: BTreeMap<WorkerId, Worker>,
    in_flight: HashMap<WorkerId, Assignment>,
    /// Slots whose old worker is gone and whose replacement is starting.
    restarting: BTreeSet<WorkerId>,
    queue: TaskQueue,
    breaker: CircuitBreaker,
    total_completed: u64,
    total_failed: u64,
    total_restarts: u64,
    matcher: Option<JoinHandle<()>>,
}

/// A task on a worker, waiting for its response line.
struct Assignment {
    task: Task,
    assigned_at: Instant,
    timer: JoinHandle<()>,
}

impl Dispatcher {
    /// Start `config.pool_size` workers one after another and begin matching.
    ///
    /// Each worker must print READY before the next one is spawned. If any
    /// worker fails to start, the ones already running are terminated and
    /// `PoolError::InitializationFailed` is returned.
    pub async fn initialize(config: PoolConfig) -> Result<Self, PoolError> {
        info!(
            pool_size = config.pool_size,
            command = %config.command.display(),
            max_queue = config.max_queue,
            task_timeout_secs = config.task_timeout.as_secs_f64(),
            "Initializing classifier pool"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                workers: BTreeMap::new(),
                in_flight: HashMap::new(),
                restarting: BTreeSet::new(),
                queue: TaskQueue::new(config.max_queue),
                breaker: CircuitBreaker::new(config.breaker.clone()),
                total_completed: 0,
                total_failed: 0,
                total_restarts: 0,
                matcher: None,
            }),
            config,
            next_task_id: AtomicU64::new(1),
            next_incarnation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });

        for worker_id in 0..shared.config.pool_size {
            if worker_id > 0 && !shared.config.startup_delay.is_zero() {
                tokio::time::sleep(shared.config.startup_delay).await;
            }
            if let Err(e) = shared.launch_worker(worker_id).await {
                error!(worker_id, error = %e, "Pool initialization failed, stopping started workers");
                shared.shutting_down.store(true, Ordering::SeqCst);
                shared.stop_all().await;
                return Err(PoolError::InitializationFailed {
                    worker_id,
                    source: Box::new(e),
                });
            }
        }

        let matcher = tokio::spawn(run_matcher(
            Arc::downgrade(&shared),
            shared.config.match_interval,
        ));
        shared.state.lock().await.matcher = Some(matcher);

        info!(workers = shared.config.pool_size, "Classifier pool ready");
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Queue a request.
    ///
    /// Rejections happen here, before anything is queued: an open breaker,
    /// a full queue, or a pool with no ready or busy worker. Otherwise the
    /// returned future resolves exactly once with the task's outcome.
    pub async fn submit(
        &self,
        request: ClassificationRequest,
    ) -> Result<PendingClassification, SubmitError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(SubmitError::ShuttingDown);
        }

        let mut guard = shared.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();

        if let Err(e) = state.breaker.admit(now) {
            debug!(error = %e, "Submission rejected");
            return Err(e);
        }

        if state.queue.is_full() {
            warn!(max = state.queue.max_len(), "Task queue full, rejecting submission");
            return Err(SubmitError::QueueFull {
                max: state.queue.max_len(),
            });
        }

        if !state.has_capacity() {
            state.breaker.record_failure(now);
            warn!(
                failures = state.breaker.consecutive_failures(),
                "No classifier workers available, rejecting submission"
            );
            return Err(SubmitError::NoWorkersAvailable);
        }

        let task_id = shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (task, pending) = Task::new(task_id, request);
        if state.queue.push(task).is_err() {
            return Err(SubmitError::QueueFull {
                max: state.queue.max_len(),
            });
        }
        debug!(task_id, queue_length = state.queue.len(), "Task queued");
        Ok(pending)
    }

    /// Submit and wait for the result.
    pub async fn classify(
        &self,
        request: ClassificationRequest,
    ) -> crate::error::Result<ClassificationResult> {
        let pending = self.submit(request).await?;
        Ok(pending.await?)
    }

    /// Replace a worker's process with a fresh one under the same id.
    ///
    /// A task in flight on the old process fails with `WorkerRestarted`.
    /// Also refills a slot left empty by an earlier failed restart.
    pub async fn restart_worker(&self, worker_id: WorkerId) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let old = {
            let mut state = shared.state.lock().await;
            if state.restarting.contains(&worker_id) {
                return Err(PoolError::RestartInProgress { worker_id });
            }
            match state.take_for_restart(worker_id) {
                Some(worker) => Some(worker),
                None if worker_id < shared.config.pool_size => {
                    state.restarting.insert(worker_id);
                    state.total_restarts += 1;
                    None
                }
                None => return Err(PoolError::WorkerNotFound { worker_id }),
            }
        };

        info!(worker_id, "Restarting worker on request");
        Arc::clone(shared).finish_restart(worker_id, old).await
    }

    /// Snapshot of workers, queue and breaker. No side effects.
    pub async fn stats(&self) -> PoolStats {
        self.shared.state.lock().await.stats()
    }

    /// Stop matching, terminate every worker and clear all pool state.
    ///
    /// Queued and in-flight tasks are dropped, so their futures resolve with
    /// `TaskError::Abandoned`. Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down classifier pool");
        let (workers, abandoned) = self.shared.stop_all().await;
        info!(workers, abandoned_tasks = abandoned, "Classifier pool shut down");
    }
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start a worker, wait for READY, register it and pump its events.
    async fn launch_worker(self: &Arc<Self>, worker_id: WorkerId) -> Result<(), PoolError> {
        let incarnation = self.next_incarnation.fetch_add(1, Ordering::Relaxed);
        let (worker, events) = Worker::start(worker_id, incarnation, &self.config).await?;

        let rejected = {
            let mut state = self.state.lock().await;
            if self.is_shutting_down() {
                Some(worker)
            } else {
                state.workers.insert(worker_id, worker);
                None
            }
        };
        if let Some(worker) = rejected {
            worker.terminate(self.config.shutdown_grace).await;
            return Err(PoolError::ShuttingDown);
        }

        tokio::spawn(pump_events(
            Arc::downgrade(self),
            worker_id,
            incarnation,
            events,
        ));
        Ok(())
    }

    /// Terminate the old process (if any) and launch its replacement.
    ///
    /// Boxed so the event pump can spawn it without a recursive future type.
    fn finish_restart(
        self: Arc<Self>,
        worker_id: WorkerId,
        old: Option<Worker>,
    ) -> BoxFuture<'static, Result<(), PoolError>> {
        async move {
            if let Some(old) = old {
                old.terminate(self.config.shutdown_grace).await;
            }
            let result = self.launch_worker(worker_id).await;
            self.state.lock().await.restarting.remove(&worker_id);
            match &result {
                Ok(()) => info!(worker_id, "Worker restarted"),
                Err(e) => error!(worker_id, error = %e, "Worker restart failed, slot left empty"),
            }
            result
        }
        .boxed()
    }

    /// Pair queued tasks with ready workers, oldest task and lowest id first.
    async fn assign_pending(self: &Arc<Self>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        while let Some(worker_id) = state.next_idle() {
            let Some(task) = state.queue.pop() else { break };
            let task_id = task.id();
            let waited_ms = task.waited().as_millis();

            let line = match task.request().to_line() {
                Ok(line) => line,
                Err(e) => {
                    state.fail_task(
                        task,
                        TaskError::Write {
                            worker_id,
                            reason: format!("request serialization failed: {e}"),
                        },
                    );
                    continue;
                }
            };

            let sent = match state.workers.get_mut(&worker_id) {
                Some(worker) => worker.assign(line),
                None => Err("worker vanished".to_string()),
            };
            if let Err(reason) = sent {
                state.fail_task(task, TaskError::Write { worker_id, reason });
                continue;
            }

            debug!(
                task_id,
                worker_id,
                waited_ms,
                submitted_at = %task.submitted_at(),
                "Task assigned"
            );
            let timer = self.arm_timeout(worker_id, task_id);
            state.in_flight.insert(
                worker_id,
                Assignment {
                    task,
                    assigned_at: Instant::now(),
                    timer,
                },
            );
        }
    }

    fn arm_timeout(self: &Arc<Self>, worker_id: WorkerId, task_id: TaskId) -> JoinHandle<()> {
        let shared = Arc::downgrade(self);
        let timeout = self.config.task_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire_task(worker_id, task_id).await;
            }
        })
    }

    async fn expire_task(&self, worker_id: WorkerId, task_id: TaskId) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let current = state
            .in_flight
            .get(&worker_id)
            .is_some_and(|a| a.task.id() == task_id);
        if !current {
            return;
        }
        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.fail();
        }
        state.fail_in_flight(
            worker_id,
            TaskError::Timeout {
                task_id,
                timeout: self.config.task_timeout,
            },
        );
    }

    async fn handle_event(self: &Arc<Self>, worker_id: WorkerId, incarnation: u64, event: ProcessEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let current = state
            .workers
            .get(&worker_id)
            .is_some_and(|w| w.incarnation() == incarnation);
        if !current {
            debug!(worker_id, incarnation, event = ?event, "Ignoring event from retired classifier process");
            return;
        }

        match event {
            ProcessEvent::Line(line) => self.handle_line(state, worker_id, line),
            ProcessEvent::IoError(reason) => {
                if state.in_flight.contains_key(&worker_id) {
                    if let Some(worker) = state.workers.get_mut(&worker_id) {
                        worker.fail();
                    }
                    state.fail_in_flight(worker_id, TaskError::Write { worker_id, reason });
                } else {
                    warn!(worker_id, reason = %reason, "Classifier I/O error");
                }
            }
            ProcessEvent::Exited(code) => {
                if let Some(worker) = state.workers.get_mut(&worker_id) {
                    worker.mark_dead();
                }
                let failed = state.fail_in_flight(worker_id, TaskError::WorkerExited { worker_id, code });
                warn!(worker_id, code = ?code, task_failed = failed, "Classifier process exited");
            }
        }
    }

    /// Route one stdout line to the task in flight on this worker.
    fn handle_line(self: &Arc<Self>, state: &mut PoolState, worker_id: WorkerId, line: String) {
        let Some(assignment) = state.in_flight.remove(&worker_id) else {
            if is_ready_line(&line) {
                debug!(worker_id, "Repeated READY from idle classifier");
            } else {
                warn!(
                    worker_id,
                    line = %line.chars().take(200).collect::<String>(),
                    "Unexpected output from idle classifier"
                );
            }
            return;
        };
        assignment.timer.abort();
        let task_id = assignment.task.id();

        match parse_reply(&line) {
            Ok(WorkerReply::Result(result)) => {
                let completed = match state.workers.get_mut(&worker_id) {
                    Some(worker) => {
                        worker.finish(true);
                        worker.tasks_completed()
                    }
                    None => 0,
                };
                state.breaker.record_success();
                state.total_completed += 1;
                debug!(
                    task_id,
                    worker_id,
                    elapsed_ms = assignment.assigned_at.elapsed().as_millis(),
                    "Task completed"
                );
                assignment.task.resolve(Ok(result));

                let threshold = self.config.restart_threshold;
                if threshold > 0 && completed >= threshold {
                    info!(worker_id, tasks_completed = completed, "Worker reached restart threshold, recycling");
                    if let Some(old) = state.take_for_restart(worker_id) {
                        tokio::spawn(Arc::clone(self).finish_restart(worker_id, Some(old)));
                    }
                }
            }
            Ok(WorkerReply::Error(message)) => {
                if let Some(worker) = state.workers.get_mut(&worker_id) {
                    worker.finish(false);
                }
                state.fail_task(assignment.task, TaskError::Classifier { message });
            }
            Err(e) => {
                if let Some(worker) = state.workers.get_mut(&worker_id) {
                    worker.fail();
                }
                state.fail_task(
                    assignment.task,
                    TaskError::MalformedResponse {
                        worker_id,
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    /// Tear everything down. Returns (workers terminated, tasks abandoned).
    async fn stop_all(&self) -> (usize, usize) {
        let (workers, abandoned) = {
            let mut state = self.state.lock().await;
            if let Some(matcher) = state.matcher.take() {
                matcher.abort();
            }
            let mut abandoned = state.queue.drain().count();
            for (_, assignment) in state.in_flight.drain() {
                assignment.timer.abort();
                abandoned += 1;
            }
            (std::mem::take(&mut state.workers), abandoned)
        };

        let count = workers.len();
        let grace = self.config.shutdown_grace;
        join_all(workers.into_values().map(|worker| worker.terminate(grace))).await;
        (count, abandoned)
    }
}

impl PoolState {
    fn has_capacity(&self) -> bool {
        self.workers.values().any(|w| w.status().has_capacity())
    }

    fn next_idle(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.status().is_idle())
            .map(Worker::id)
    }

    /// Resolve a task with a failure and count it against the breaker.
    fn fail_task(&mut self, task: Task, error: TaskError) {
        self.breaker.record_failure(Instant::now());
        self.total_failed += 1;
        warn!(task_id = task.id(), error = %error, "Task failed");
        task.resolve(Err(error));
    }

    /// Fail whatever is in flight on `worker_id`. Returns false if nothing was.
    fn fail_in_flight(&mut self, worker_id: WorkerId, error: TaskError) -> bool {
        match self.in_flight.remove(&worker_id) {
            Some(assignment) => {
                assignment.timer.abort();
                self.fail_task(assignment.task, error);
                true
            }
            None => false,
        }
    }

    /// Pull a worker out of rotation ahead of a restart.
    fn take_for_restart(&mut self, worker_id: WorkerId) -> Option<Worker> {
        let worker = self.workers.remove(&worker_id)?;
        if let Some(assignment) = self.in_flight.remove(&worker_id) {
            assignment.timer.abort();
            self.total_failed += 1;
            assignment
                .task
                .resolve(Err(TaskError::WorkerRestarted { worker_id }));
        }
        self.restarting.insert(worker_id);
        self.total_restarts += 1;
        Some(worker)
    }

    fn stats(&self) -> PoolStats {
        let workers: Vec<_> = self.workers.values().map(Worker::snapshot).collect();
        PoolStats {
            total_workers: workers.len(),
            ready_workers: PoolStats::count(&workers, WorkerStatus::Ready),
            busy_workers: PoolStats::count(&workers, WorkerStatus::Busy),
            error_workers: PoolStats::count(&workers, WorkerStatus::Error),
            dead_workers: PoolStats::count(&workers, WorkerStatus::Dead),
            initializing_workers: self.restarting.len(),
            queue_length: self.queue.len(),
            total_tasks_completed: self.total_completed,
            total_tasks_failed: self.total_failed,
            total_restarts: self.total_restarts,
            circuit_breaker: self.breaker.snapshot(),
            workers,
        }
    }
}

/// Forward one worker's process events into the dispatcher.
async fn pump_events(
    shared: Weak<Shared>,
    worker_id: WorkerId,
    incarnation: u64,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        let exited = matches!(event, ProcessEvent::Exited(_));
        shared.handle_event(worker_id, incarnation, event).await;
        if exited {
            break;
        }
    }
}

/// Fixed-interval matching loop. Stops on shutdown or when the pool is dropped.
async fn run_matcher(shared: Weak<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else { break };
        if shared.is_shutting_down() {
            break;
        }
        shared.assign_pending().await;
    }
    debug!("Matching loop stopped");
}
