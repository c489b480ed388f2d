//! Job queue and dispatch loop.
//!
//! [`JobQueue::enqueue`] persists a process and returns at once with an
//! [`Admission`]. [`JobQueue::trigger`] makes sure exactly one dispatch loop
//! is running; the loop pops pending processes in FIFO order while a
//! [`Semaphore`] permit is available and hands each one to a supervised
//! worker on the queue's [`TaskTracker`].
//!
//! Workers own the whole outcome of a process: publishing the result,
//! re-enqueueing after transient failures, writing the diagnostic log, and
//! recording panics as `ERROR "worker crashed"`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use imgflow_core::error::CoreError;
use imgflow_core::process::{Process, ProcessOutcome};
use imgflow_core::runtime::{ContainerRuntime, ExecutionError, ExecutionOutput, ExecutionRequest};
use imgflow_core::status::StatusRecord;
use imgflow_core::types::EntityId;
use imgflow_store::{with_io_retry, EntityKey, ResultStore, RetryPolicy, StatusTracker};
use serde_json::{json, Value};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::QueueConfig;

/// How long a timed-out runtime gets to stop its container.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Handle returned by [`JobQueue::enqueue`].
#[derive(Debug)]
pub struct Admission {
    pub process_id: EntityId,
    /// Resolves once the process reaches a terminal status.
    pub completion: oneshot::Receiver<ProcessOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The process was still pending and is now CANCELLED.
    Removed,
    /// The process is running; its runtime has been signalled.
    Signalled,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<EntityId>,
    running: HashMap<EntityId, CancellationToken>,
    /// Waiting out a retry delay before going back to `pending`.
    backing_off: HashSet<EntityId>,
    waiters: HashMap<EntityId, oneshot::Sender<ProcessOutcome>>,
}

/// What a worker decided for its process.
enum Settled {
    Final(ProcessOutcome),
    Retry { attempt: u32 },
}

struct Inner {
    config: QueueConfig,
    runtime: Arc<dyn ContainerRuntime>,
    tracker: Arc<StatusTracker>,
    results: ResultStore,
    state: Mutex<QueueState>,
    capacity: Arc<Semaphore>,
    dispatching: AtomicBool,
    workers: TaskTracker,
    shutdown: CancellationToken,
    io_retry: RetryPolicy,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pop the next pending process and register it as running.
    fn take_next(&self) -> Option<(EntityId, CancellationToken)> {
        let mut state = self.state();
        let id = state.pending.pop_front()?;
        let token = CancellationToken::new();
        state.running.insert(id, token.clone());
        Some((id, token))
    }
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(
        config: QueueConfig,
        runtime: Arc<dyn ContainerRuntime>,
        tracker: Arc<StatusTracker>,
        results: ResultStore,
    ) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                tracker,
                results,
                state: Mutex::new(QueueState::default()),
                capacity,
                dispatching: AtomicBool::new(false),
                workers: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                io_retry: RetryPolicy::default(),
            }),
        }
    }

    /// Persist `process` as PENDING and append it to the queue.
    ///
    /// Does not start execution; call [`trigger`](Self::trigger) afterwards.
    pub async fn enqueue(&self, process: Process) -> Result<Admission, CoreError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::Conflict("Job queue is shutting down".into()));
        }
        let id = process.identifier;
        let key = EntityKey::Process(id);
        with_io_retry(self.inner.io_retry, || self.inner.tracker.create(&key, &process)).await?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state();
            state.waiters.insert(id, tx);
            state.pending.push_back(id);
        }
        tracing::info!(
            process_id = %id,
            service = %process.service_path,
            "Process enqueued",
        );
        Ok(Admission {
            process_id: id,
            completion: rx,
        })
    }

    /// Ensure a dispatch loop is running. Never starts a second one.
    pub fn trigger(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if self
            .inner
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let queue = self.clone();
        self.inner.workers.spawn(async move { queue.dispatch_loop().await });
    }

    /// Cancel a pending or running process.
    pub async fn cancel(&self, id: EntityId) -> Result<CancelOutcome, CoreError> {
        enum Found {
            Queued(Option<oneshot::Sender<ProcessOutcome>>),
            Running(CancellationToken),
            Untracked,
        }

        let found = {
            let mut state = self.inner.state();
            if let Some(pos) = state.pending.iter().position(|p| *p == id) {
                state.pending.remove(pos);
                Found::Queued(state.waiters.remove(&id))
            } else if state.backing_off.remove(&id) {
                Found::Queued(state.waiters.remove(&id))
            } else if let Some(token) = state.running.get(&id) {
                Found::Running(token.clone())
            } else {
                Found::Untracked
            }
        };

        match found {
            Found::Queued(waiter) => {
                let outcome = self
                    .settle(id, StatusRecord::cancelled("cancelled before execution"), None, None)
                    .await;
                if let Some(tx) = waiter {
                    let _ = tx.send(outcome);
                }
                tracing::info!(process_id = %id, "Pending process cancelled");
                Ok(CancelOutcome::Removed)
            }
            Found::Running(token) => {
                token.cancel();
                tracing::info!(process_id = %id, "Running process signalled to stop");
                Ok(CancelOutcome::Signalled)
            }
            Found::Untracked => {
                let process = self.status(id).await?;
                Err(CoreError::Conflict(format!(
                    "Process {id} is not pending or running ({})",
                    process.status.status_code
                )))
            }
        }
    }

    /// Current snapshot of a process.
    pub async fn status(&self, id: EntityId) -> Result<Process, CoreError> {
        self.inner.tracker.read(&EntityKey::Process(id)).await
    }

    /// Number of pending and running processes.
    pub fn depth(&self) -> (usize, usize) {
        let state = self.inner.state();
        (
            state.pending.len() + state.backing_off.len(),
            state.running.len(),
        )
    }

    /// Stop dispatching and wait for the supervised workers to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.workers.close();
        self.inner.workers.wait().await;
        tracing::info!("Job queue drained");
    }

    /// Mark processes left non-terminal by a previous run as ERROR.
    ///
    /// Call once at startup, before anything is enqueued.
    pub async fn recover_interrupted(&self) -> Result<usize, CoreError> {
        let mut recovered = 0;
        for id in self.inner.tracker.process_ids().await? {
            let process = match self.status(id).await {
                Ok(process) => process,
                Err(e) => {
                    tracing::warn!(process_id = %id, error = %e, "Skipping unreadable process snapshot");
                    continue;
                }
            };
            if process.is_terminal() {
                continue;
            }
            self.update_process(id, |p| {
                p.set_status(StatusRecord::error("interrupted by restart"))
            })
            .await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(recovered, "Marked interrupted processes as failed");
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch_loop(&self) {
        tracing::debug!("Dispatch loop started");
        loop {
            self.drain().await;
            self.inner.dispatching.store(false, Ordering::Release);

            // Work enqueued between the last pop and clearing the flag would
            // otherwise wait for the next trigger.
            let has_work = !self.inner.state().pending.is_empty();
            if !has_work
                || self.inner.shutdown.is_cancelled()
                || self
                    .inner
                    .dispatching
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }
        tracing::debug!("Dispatch loop idle");
    }

    /// Dispatch while there is capacity and pending work.
    async fn drain(&self) {
        loop {
            let permit = tokio::select! {
                permit = self.inner.capacity.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = self.inner.shutdown.cancelled() => return,
            };
            let Some((id, cancel)) = self.inner.take_next() else {
                return;
            };
            let queue = self.clone();
            self.inner
                .workers
                .spawn(async move { queue.supervise(id, cancel, permit).await });
        }
    }

    /// Run one process and deliver its outcome. A panic inside the
    /// execution is caught here and recorded on the process.
    async fn supervise(&self, id: EntityId, cancel: CancellationToken, permit: OwnedSemaphorePermit) {
        let queue = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { queue.execute(id, token).await });

        let settled = match handle.await {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!(process_id = %id, error = %e, "Worker crashed");
                Settled::Final(
                    self.settle(id, StatusRecord::error("worker crashed"), None, None)
                        .await,
                )
            }
        };
        self.inner.state().running.remove(&id);
        drop(permit);

        match settled {
            Settled::Final(outcome) => {
                let waiter = self.inner.state().waiters.remove(&id);
                tracing::info!(
                    process_id = %id,
                    status = %outcome.status.status_code,
                    "Process finished",
                );
                if let Some(tx) = waiter {
                    let _ = tx.send(outcome);
                }
            }
            Settled::Retry { attempt } => {
                self.inner.state().backing_off.insert(id);
                let delay = self.inner.config.retry_backoff * attempt;
                tracing::info!(
                    process_id = %id,
                    retry_count = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Process re-enqueued",
                );
                let queue = self.clone();
                self.inner.workers.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = queue.inner.shutdown.cancelled() => return,
                    }
                    let requeued = {
                        let mut state = queue.inner.state();
                        let waiting = state.backing_off.remove(&id);
                        if waiting {
                            state.pending.push_back(id);
                        }
                        waiting
                    };
                    if requeued {
                        queue.trigger();
                    }
                });
            }
        }
    }

    async fn execute(&self, id: EntityId, cancel: CancellationToken) -> Settled {
        let process = match self
            .update_process(id, |p| p.set_status(StatusRecord::in_progress("running", 0)))
            .await
        {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(process_id = %id, error = %e, "Failed to mark process running");
                return Settled::Final(ProcessOutcome {
                    process_id: id,
                    status: StatusRecord::error(format!("status unavailable: {e}")),
                    result_location: None,
                    error_log: None,
                });
            }
        };

        let dirs = match self.inner.results.prepare(id).await {
            Ok(dirs) => dirs,
            Err(e) => return Settled::Final(self.fail(id, e.to_string(), &e.to_string()).await),
        };

        let timeout = process
            .execution
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.inner.config.default_timeout);
        let request = ExecutionRequest {
            process_id: id,
            image: process.execution.image.clone(),
            command: process.execution.command.clone(),
            inputs: process.input_parameters.clone(),
            input_dir: dirs.input,
            output_dir: dirs.output.clone(),
            timeout,
        };
        tracing::info!(
            process_id = %id,
            image = %request.image,
            attempt = process.retry_count + 1,
            "Process started",
        );

        let result = self.run_with_timeout(request, &cancel, timeout).await;

        if cancel.is_cancelled() {
            // Whatever the runtime produced after a cancel request is discarded.
            return Settled::Final(
                self.settle(id, StatusRecord::cancelled("cancelled by request"), None, None)
                    .await,
            );
        }

        match result {
            Ok(output) => {
                let document = result_document(id, &output, &dirs.output);
                match self.inner.results.publish(id, &document).await {
                    Ok(location) => Settled::Final(
                        self.settle(id, StatusRecord::done("finished"), Some(location), None)
                            .await,
                    ),
                    Err(e) => Settled::Final(
                        self.fail(id, format!("failed to publish result: {e}"), &output.stderr)
                            .await,
                    ),
                }
            }
            Err(e) if e.is_transient() && process.retry_count < self.inner.config.max_retries => {
                let attempt = process.retry_count + 1;
                let max = self.inner.config.max_retries;
                let message = format!("retry {attempt} of {max}: {e}");
                if let Err(write_err) = self
                    .update_process(id, |p| {
                        p.retry_count = attempt;
                        p.set_status(StatusRecord::pending(message.clone()));
                    })
                    .await
                {
                    tracing::error!(process_id = %id, error = %write_err, "Failed to record retry");
                }
                Settled::Retry { attempt }
            }
            Err(e) => {
                let log = e.stderr().map(str::to_string).unwrap_or_else(|| e.to_string());
                let err = CoreError::from(e);
                let message = match &err {
                    CoreError::ContainerExecution(ExecutionError::Timeout { .. }) => {
                        "timeout".to_string()
                    }
                    other => other.to_string(),
                };
                tracing::warn!(process_id = %id, error = %err, "Process failed");
                Settled::Final(self.fail(id, message, &log).await)
            }
        }
    }

    /// Run the container, enforcing `timeout` even if the runtime does not.
    async fn run_with_timeout(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let started = Instant::now();
        let exec_cancel = cancel.child_token();
        let run = self.inner.runtime.run(request, exec_cancel.clone());
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(timeout) => {
                exec_cancel.cancel();
                let _ = tokio::time::timeout(TERMINATE_GRACE, &mut run).await;
                Err(ExecutionError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status writes
    // -----------------------------------------------------------------------

    async fn update_process<F>(&self, id: EntityId, mutate: F) -> Result<Process, CoreError>
    where
        F: Fn(&mut Process),
    {
        let key = EntityKey::Process(id);
        let (process, ()) = with_io_retry(self.inner.io_retry, || {
            self.inner.tracker.update(&key, |p: &mut Process| {
                mutate(p);
                Ok(())
            })
        })
        .await?;
        Ok(process)
    }

    /// Record a terminal status. Storage failures are logged; the outcome
    /// is still delivered to the waiter.
    async fn settle(
        &self,
        id: EntityId,
        status: StatusRecord,
        result_location: Option<std::path::PathBuf>,
        error_log: Option<std::path::PathBuf>,
    ) -> ProcessOutcome {
        let written = self
            .update_process(id, |p| {
                p.set_status(status.clone());
                p.result_location = result_location.clone();
                p.error_log = error_log.clone();
            })
            .await;
        match written {
            Ok(process) => ProcessOutcome::from_process(&process),
            Err(e) => {
                tracing::error!(process_id = %id, error = %e, "Failed to record process outcome");
                ProcessOutcome {
                    process_id: id,
                    status,
                    result_location,
                    error_log,
                }
            }
        }
    }

    /// Write the diagnostic log and record ERROR.
    async fn fail(&self, id: EntityId, message: String, diagnostics: &str) -> ProcessOutcome {
        let error_log = match self.inner.results.write_stderr_log(id, diagnostics).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(process_id = %id, error = %e, "Failed to write diagnostic log");
                None
            }
        };
        self.settle(id, StatusRecord::error(message), None, error_log)
            .await
    }
}

/// Document published as `result.json`.
fn result_document(id: EntityId, output: &ExecutionOutput, output_dir: &Path) -> Value {
    let value = output
        .parsed_output
        .clone()
        .unwrap_or_else(|| Value::String(output.stdout.trim().to_string()));
    json!({
        "processId": id,
        "exitCode": output.exit_code,
        "durationMs": output.duration_ms,
        "output": value,
        "outputDir": output_dir,
    })
}
