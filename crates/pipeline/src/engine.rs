//! Workflow engine: registration, execution and the polling surface.
//!
//! Registration moves a [`WorkflowDefinition`] through parsing into a
//! [`ParsedWorkflow`] and finally a registered [`ServiceEntry`]; any
//! rejection along the way is an `Err` and leaves the registry untouched.
//!
//! A workflow execution creates a [`WorkflowRun`] and a supervised driver
//! task. The driver enqueues a step only once every step it binds to is
//! DONE, stages upstream results into the step's input folder, and skips
//! the transitive dependents of a failed step while independent branches
//! run to completion.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use imgflow_core::error::{CoreError, ValidationKind};
use imgflow_core::process::{Process, ProcessOutcome, WorkflowRun};
use imgflow_core::service::{ExecutionSpec, ServiceEntry, ServiceKind};
use imgflow_core::status::{StatusCode, StatusRecord};
use imgflow_core::types::EntityId;
use imgflow_core::workflow::{parse_definition, Binding, ParsedWorkflow, ResolvedStep, WorkflowDefinition};
use imgflow_store::{with_io_retry, EntityKey, ResultStore, RetryPolicy, ServiceRegistry, StatusTracker};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::queue::{Admission, JobQueue};

/// What [`WorkflowEngine::execute`] admitted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Process id for algorithms, run id for workflows.
    pub identifier: EntityId,
    pub kind: ServiceKind,
    pub status: StatusRecord,
}

/// A polled entity: a single process or a workflow run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Tracked {
    Process(Process),
    WorkflowRun(WorkflowRun),
}

impl Tracked {
    pub fn status(&self) -> &StatusRecord {
        match self {
            Self::Process(p) => &p.status,
            Self::WorkflowRun(r) => &r.status,
        }
    }

    fn result_location(&self) -> Option<&PathBuf> {
        match self {
            Self::Process(p) => p.result_location.as_ref(),
            Self::WorkflowRun(r) => r.result_location.as_ref(),
        }
    }
}

/// Completion of one step process, as seen by the run driver.
type StepCompletion = (String, Option<ProcessOutcome>);

/// A DONE step: its process and the location of its published result.
#[derive(Debug, Clone)]
struct Published {
    process_id: EntityId,
    location: PathBuf,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    registry: Arc<ServiceRegistry>,
    queue: JobQueue,
    tracker: Arc<StatusTracker>,
    results: ResultStore,
    runs: TaskTracker,
    active: Arc<Mutex<HashMap<EntityId, CancellationToken>>>,
    shutdown: CancellationToken,
    io_retry: RetryPolicy,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        queue: JobQueue,
        tracker: Arc<StatusTracker>,
        results: ResultStore,
    ) -> Self {
        Self {
            registry,
            queue,
            tracker,
            results,
            runs: TaskTracker::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            io_retry: RetryPolicy::default(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Validate a definition against the current registry.
    pub async fn parse(&self, definition: &WorkflowDefinition) -> Result<ParsedWorkflow, CoreError> {
        let entries = self.registry.list(None).await;
        parse_definition(definition, |path| {
            entries.iter().find(|e| e.path == path).cloned()
        })
    }

    /// Register a parsed workflow and persist its descriptor.
    pub async fn register(&self, parsed: &ParsedWorkflow) -> Result<ServiceEntry, CoreError> {
        let descriptor = serde_json::to_value(parsed).map_err(|source| CoreError::Serialization {
            path: format!("/workflows/{}/{}", parsed.name, parsed.version),
            source,
        })?;
        let entry = ServiceEntry::new(
            ServiceKind::Workflow,
            &parsed.name,
            &parsed.version,
            StatusRecord::done("workflow registered"),
        )
        .with_description(parsed.description.clone());
        self.registry.register(entry, Some(&descriptor)).await
    }

    /// Parse then register.
    pub async fn register_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<ServiceEntry, CoreError> {
        let parsed = self.parse(definition).await?;
        self.register(&parsed).await
    }

    pub async fn register_algorithm(
        &self,
        name: &str,
        version: &str,
        execution: ExecutionSpec,
        description: Option<String>,
    ) -> Result<ServiceEntry, CoreError> {
        if execution.image.trim().is_empty() {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                "Algorithm image must not be empty",
            ));
        }
        if execution.timeout_secs == Some(0) {
            return Err(CoreError::validation(
                ValidationKind::Malformed,
                "Algorithm timeout must be at least one second",
            ));
        }
        let entry =
            ServiceEntry::algorithm(name, version, execution).with_description(description);
        self.registry.register(entry, None).await
    }

    /// Soft-delete a service. In-flight processes finish normally and their
    /// results stay retrievable.
    pub async fn delete(&self, id: EntityId) -> Result<ServiceEntry, CoreError> {
        self.registry.soft_delete(id).await
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Admit an execution of the service at `path`.
    ///
    /// Algorithms become one queued process. Workflows become a run driven
    /// by a background task. The dispatch loop is not triggered for
    /// algorithms; callers do that once they have answered.
    pub async fn execute(&self, path: &str, request: Value) -> Result<Execution, CoreError> {
        let entry = self.registry.lookup_by_path(path).await?;
        match entry.kind {
            ServiceKind::Algorithm => self.execute_algorithm(&entry, request).await,
            ServiceKind::Workflow => self.execute_workflow(&entry, request).await,
        }
    }

    /// Start the dispatch loop if it is idle.
    pub fn trigger(&self) {
        self.queue.trigger();
    }

    async fn execute_algorithm(
        &self,
        entry: &ServiceEntry,
        request: Value,
    ) -> Result<Execution, CoreError> {
        if !entry.is_available() {
            return Err(CoreError::not_found("Service", &entry.path));
        }
        let execution = entry.execution.clone().ok_or_else(|| {
            CoreError::Conflict(format!("Algorithm {} has no execution spec", entry.path))
        })?;
        let process = Process::new(entry.identifier, &entry.path, execution, request);
        let status = process.status.clone();
        let Admission { process_id, .. } = self.queue.enqueue(process).await?;
        Ok(Execution {
            identifier: process_id,
            kind: ServiceKind::Algorithm,
            status,
        })
    }

    async fn execute_workflow(
        &self,
        entry: &ServiceEntry,
        request: Value,
    ) -> Result<Execution, CoreError> {
        let parsed = self.load_descriptor(entry).await?;

        // Step targets are re-resolved so a re-registered algorithm is used
        // and a deleted one is refused before anything is admitted.
        let mut targets = HashMap::new();
        for step in &parsed.steps {
            let target = self.registry.lookup_by_path(&step.target_path).await?;
            if !target.is_available() || target.kind != ServiceKind::Algorithm {
                return Err(CoreError::not_found("Service", &step.target_path));
            }
            targets.insert(step.id.clone(), target);
        }

        let run = WorkflowRun::new(entry.identifier, &entry.path, parsed.order.clone());
        let run_id = run.identifier;
        let status = run.status.clone();
        let key = EntityKey::Run(run_id);
        with_io_retry(self.io_retry, || self.tracker.create(&key, &run)).await?;

        let cancel = CancellationToken::new();
        self.lock_active().insert(run_id, cancel.clone());

        let engine = self.clone();
        self.runs.spawn(async move {
            engine.drive(run_id, parsed, targets, request, cancel).await;
            engine.lock_active().remove(&run_id);
        });

        tracing::info!(run_id = %run_id, workflow = %entry.path, "Workflow run admitted");
        Ok(Execution {
            identifier: run_id,
            kind: ServiceKind::Workflow,
            status,
        })
    }

    async fn load_descriptor(&self, entry: &ServiceEntry) -> Result<ParsedWorkflow, CoreError> {
        let descriptor = self
            .registry
            .descriptor(entry)
            .await?
            .ok_or_else(|| CoreError::not_found("Workflow descriptor", &entry.path))?;
        serde_json::from_value(descriptor).map_err(|source| CoreError::Serialization {
            path: self.registry.descriptor_path(entry).display().to_string(),
            source,
        })
    }

    // -----------------------------------------------------------------------
    // Polling and control
    // -----------------------------------------------------------------------

    /// Resolve a workflow run or a process by identifier.
    pub async fn status(&self, id: EntityId) -> Result<Tracked, CoreError> {
        if let Some(run) = self.tracker.try_read::<WorkflowRun>(&EntityKey::Run(id)).await? {
            return Ok(Tracked::WorkflowRun(run));
        }
        if let Some(process) = self.tracker.try_read::<Process>(&EntityKey::Process(id)).await? {
            return Ok(Tracked::Process(process));
        }
        Err(CoreError::not_found("Process", id))
    }

    /// Published result of a finished process or workflow run.
    pub async fn result(&self, id: EntityId) -> Result<Value, CoreError> {
        let tracked = self.status(id).await?;
        match (tracked.status().status_code, tracked.result_location()) {
            (StatusCode::Done, Some(location)) => self.results.read_at(location).await,
            (code, _) => Err(CoreError::Conflict(format!(
                "{id} has no published result ({code})"
            ))),
        }
    }

    /// Cancel a workflow run or a single process.
    pub async fn cancel(&self, id: EntityId) -> Result<Tracked, CoreError> {
        let run_token = self.lock_active().get(&id).cloned();
        if let Some(token) = run_token {
            token.cancel();
            tracing::info!(run_id = %id, "Workflow run cancellation requested");
            return self.status(id).await;
        }
        match self.status(id).await? {
            Tracked::WorkflowRun(run) => Err(CoreError::Conflict(format!(
                "Workflow run {id} is not running ({})",
                run.status.status_code
            ))),
            Tracked::Process(_) => {
                self.queue.cancel(id).await?;
                self.status(id).await
            }
        }
    }

    /// Fail runs left unsettled by a previous run of the service.
    pub async fn recover_interrupted(&self) -> Result<usize, CoreError> {
        let mut recovered = 0;
        for id in self.tracker.run_ids().await? {
            let key = EntityKey::Run(id);
            let run: WorkflowRun = match self.tracker.read(&key).await {
                Ok(run) => run,
                Err(e) => {
                    tracing::warn!(run_id = %id, error = %e, "Skipping unreadable run snapshot");
                    continue;
                }
            };
            if run.is_settled() {
                continue;
            }
            self.update_run(id, |run| {
                let open: Vec<String> = run
                    .steps
                    .iter()
                    .filter(|s| !s.status.is_terminal())
                    .map(|s| s.step_id.clone())
                    .collect();
                for step in open {
                    run.record_step(&step, StatusRecord::error("interrupted by restart"), None);
                }
            })
            .await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(recovered, "Marked interrupted workflow runs as failed");
        }
        Ok(recovered)
    }

    /// Stop the run drivers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.runs.close();
        self.runs.wait().await;
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<EntityId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Run driver
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        run_id: EntityId,
        parsed: ParsedWorkflow,
        targets: HashMap<String, ServiceEntry>,
        request: Value,
        cancel: CancellationToken,
    ) {
        let mut waiting: BTreeSet<String> = parsed.order.iter().cloned().collect();
        let mut finished: HashMap<String, Published> = HashMap::new();
        let mut launched: HashMap<String, EntityId> = HashMap::new();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, StepCompletion>> =
            FuturesUnordered::new();
        let mut cancelled = false;

        loop {
            if !cancelled {
                let ready: Vec<ResolvedStep> = parsed
                    .ordered_steps()
                    .filter(|s| {
                        waiting.contains(&s.id)
                            && s.depends_on.iter().all(|d| finished.contains_key(d))
                    })
                    .cloned()
                    .collect();

                let mut enqueued = false;
                for step in ready {
                    waiting.remove(&step.id);
                    match self.launch(run_id, &step, &targets, &request, &finished).await {
                        Ok(admission) => {
                            enqueued = true;
                            launched.insert(step.id.clone(), admission.process_id);
                            let step_id = step.id.clone();
                            in_flight.push(
                                async move { (step_id, admission.completion.await.ok()) }.boxed(),
                            );
                        }
                        Err(e) => {
                            tracing::error!(run_id = %run_id, step = %step.id, error = %e, "Failed to start step");
                            let status = StatusRecord::error(format!("failed to start: {e}"));
                            self.step_failed(run_id, &parsed, &step.id, status, &mut waiting)
                                .await;
                        }
                    }
                }
                if enqueued {
                    self.queue.trigger();
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((step_id, outcome)) = in_flight.next() => {
                    launched.remove(&step_id);
                    match outcome {
                        Some(outcome) if outcome.succeeded() => {
                            if let Some(location) = &outcome.result_location {
                                finished.insert(
                                    step_id.clone(),
                                    Published {
                                        process_id: outcome.process_id,
                                        location: location.clone(),
                                    },
                                );
                            }
                            self.record_step(run_id, &step_id, outcome.status, outcome.result_location)
                                .await;
                        }
                        Some(outcome) => {
                            self.step_failed(run_id, &parsed, &step_id, outcome.status, &mut waiting)
                                .await;
                        }
                        None => {
                            let status = StatusRecord::error("process abandoned");
                            self.step_failed(run_id, &parsed, &step_id, status, &mut waiting)
                                .await;
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    if let Err(e) = self.update_run(run_id, |run| run.request_cancel()).await {
                        tracing::error!(run_id = %run_id, error = %e, "Failed to record run cancellation");
                    }
                    for process_id in launched.values() {
                        if let Err(e) = self.queue.cancel(*process_id).await {
                            tracing::debug!(run_id = %run_id, process_id = %process_id, error = %e, "Step not cancellable");
                        }
                    }
                    for step_id in std::mem::take(&mut waiting) {
                        self.record_step(run_id, &step_id, StatusRecord::skipped("run cancelled"), None)
                            .await;
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!(run_id = %run_id, "Run driver stopped by shutdown");
                    return;
                }
            }
        }

        match self.tracker.read::<WorkflowRun>(&EntityKey::Run(run_id)).await {
            Ok(run) => tracing::info!(
                run_id = %run_id,
                status = %run.status.status_code,
                "Workflow run finished",
            ),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "Workflow run snapshot unreadable"),
        }
    }

    /// Build the step's inputs, stage upstream results, and enqueue it.
    async fn launch(
        &self,
        run_id: EntityId,
        step: &ResolvedStep,
        targets: &HashMap<String, ServiceEntry>,
        request: &Value,
        finished: &HashMap<String, Published>,
    ) -> Result<Admission, CoreError> {
        let target = targets
            .get(&step.id)
            .ok_or_else(|| CoreError::not_found("Service", &step.target_path))?;
        let execution = target.execution.clone().ok_or_else(|| {
            CoreError::Conflict(format!("Algorithm {} has no execution spec", target.path))
        })?;
        let mut process =
            Process::new(target.identifier, &target.path, execution, Value::Null).for_step(run_id, &step.id);
        let process_id = process.identifier;

        let mut inputs = Map::new();
        for (slot, binding) in &step.bindings {
            let value = match binding {
                Binding::Request { key: None } => request.clone(),
                Binding::Request { key: Some(key) } => {
                    request.get(key).cloned().unwrap_or(Value::Null)
                }
                Binding::Step { step: upstream, .. } => {
                    let published = finished.get(upstream).ok_or_else(|| {
                        CoreError::Conflict(format!("Step '{upstream}' has no published result"))
                    })?;
                    let staged = self
                        .results
                        .stage_input(process_id, slot, &published.location)
                        .await?;
                    self.results
                        .stage_output(process_id, slot, published.process_id)
                        .await?;
                    let document = self.results.read_at(&staged).await?;
                    json!({
                        "path": format!("/input/{slot}.json"),
                        "files": format!("/input/{slot}"),
                        "value": document.get("output").cloned().unwrap_or(Value::Null),
                    })
                }
            };
            inputs.insert(slot.clone(), value);
        }
        if !step.parameters.is_empty() {
            inputs.insert("parameters".into(), Value::Object(step.parameters.clone()));
        }
        process.input_parameters = Value::Object(inputs);

        let admission = self.queue.enqueue(process).await?;
        let step_id = step.id.clone();
        if let Err(e) = self
            .update_run(run_id, |run| {
                if let Some(s) = run.step_mut(&step_id) {
                    s.process_id = Some(process_id);
                    s.status = StatusRecord::in_progress("dispatched", 0);
                }
                run.refresh_aggregate();
            })
            .await
        {
            tracing::error!(run_id = %run_id, step = %step_id, error = %e, "Failed to record step dispatch");
        }
        tracing::debug!(run_id = %run_id, step = %step_id, process_id = %process_id, "Step enqueued");
        Ok(admission)
    }

    /// Record a failed step and skip everything downstream of it.
    async fn step_failed(
        &self,
        run_id: EntityId,
        parsed: &ParsedWorkflow,
        step_id: &str,
        status: StatusRecord,
        waiting: &mut BTreeSet<String>,
    ) {
        tracing::warn!(
            run_id = %run_id,
            step = %step_id,
            status = %status.status_code,
            "Workflow step failed",
        );
        self.record_step(run_id, step_id, status, None).await;

        let message = format!("upstream step '{step_id}' failed");
        for dependent in parsed.transitive_dependents(step_id) {
            if waiting.remove(&dependent) {
                self.record_step(run_id, &dependent, StatusRecord::skipped(message.clone()), None)
                    .await;
            }
        }
    }

    async fn record_step(
        &self,
        run_id: EntityId,
        step_id: &str,
        status: StatusRecord,
        result_location: Option<PathBuf>,
    ) {
        let written = self
            .update_run(run_id, |run| {
                run.record_step(step_id, status.clone(), result_location.clone())
            })
            .await;
        if let Err(e) = written {
            tracing::error!(run_id = %run_id, step = %step_id, error = %e, "Failed to record step status");
        }
    }

    async fn update_run<F>(&self, run_id: EntityId, mutate: F) -> Result<WorkflowRun, CoreError>
    where
        F: Fn(&mut WorkflowRun),
    {
        let key = EntityKey::Run(run_id);
        let (run, ()) = with_io_retry(self.io_retry, || {
            self.tracker.update(&key, |run: &mut WorkflowRun| {
                mutate(run);
                Ok(())
            })
        })
        .await?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_serializes_with_type_tag() {
        let process = Process::new(
            uuid::Uuid::new_v4(),
            "/algorithms/binarize/1.0",
            ExecutionSpec {
                image: "binarize:1.0".into(),
                command: vec![],
                timeout_secs: None,
            },
            Value::Null,
        );
        let json = serde_json::to_value(Tracked::Process(process)).unwrap();
        assert_eq!(json["type"], "process");
        assert_eq!(json["status"]["statusCode"], 100);

        let run = WorkflowRun::new(uuid::Uuid::new_v4(), "/workflows/ocr/1.0", ["a", "b"]);
        let json = serde_json::to_value(Tracked::WorkflowRun(run)).unwrap();
        assert_eq!(json["type"], "workflowRun");
        assert_eq!(json["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn tracked_status_reads_through() {
        let run = WorkflowRun::new(uuid::Uuid::new_v4(), "/workflows/ocr/1.0", ["a"]);
        let tracked = Tracked::WorkflowRun(run);
        assert_eq!(tracked.status().status_code, StatusCode::Pending);
        assert!(tracked.result_location().is_none());
    }
}
