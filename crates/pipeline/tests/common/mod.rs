#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use imgflow_core::runtime::{ContainerRuntime, ExecutionError, ExecutionOutput, ExecutionRequest};
use imgflow_core::service::{ExecutionSpec, ServiceEntry};
use imgflow_core::status::StatusRecord;
use imgflow_core::types::EntityId;
use imgflow_pipeline::{JobQueue, QueueConfig, Tracked, WorkflowEngine};
use imgflow_store::{ResultStore, ServiceRegistry, StatusTracker, StoragePaths};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// One call observed by [`ScriptedRuntime`].
#[derive(Debug, Clone)]
pub struct Call {
    pub process_id: EntityId,
    pub image: String,
    pub inputs: Value,
    /// Files found in the input folder's sub-folders at call time, as
    /// `slot/file`.
    pub staged: Vec<String>,
}

/// Runtime whose behaviour is picked by the image name:
///
/// - `fail`: exits 1 with stderr `boom`
/// - `flaky`: transfer error on the first attempt of each process
/// - `hang`: waits for cancellation
/// - `slow`: succeeds after 150 ms
/// - `stubborn`: ignores cancellation and succeeds after 20 ms
/// - `panic`: panics
/// - anything else: succeeds, echoing the image and inputs
///
/// Every success also writes `{image}.txt` into the output folder.
#[derive(Default)]
pub struct ScriptedRuntime {
    calls: Mutex<Vec<Call>>,
    attempts: Mutex<HashMap<EntityId, u32>>,
}

impl ScriptedRuntime {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn images(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.image).collect()
    }

    fn ok(request: &ExecutionRequest) -> ExecutionOutput {
        std::fs::write(
            request.output_dir.join(format!("{}.txt", request.image)),
            request.image.as_bytes(),
        )
        .unwrap();
        let output = json!({ "image": request.image, "inputs": request.inputs });
        ExecutionOutput {
            stdout: output.to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
            parsed_output: Some(output),
        }
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(request.process_id).or_insert(0);
            *n += 1;
            *n
        };
        self.calls.lock().unwrap().push(Call {
            process_id: request.process_id,
            image: request.image.clone(),
            inputs: request.inputs.clone(),
            staged: staged_files(&request.input_dir),
        });

        match request.image.as_str() {
            "fail" => Err(ExecutionError::Exited {
                exit_code: 1,
                stderr: "boom".into(),
            }),
            "flaky" if attempt == 1 => Err(ExecutionError::Transfer("image pull reset".into())),
            "hang" => {
                cancel.cancelled().await;
                Err(ExecutionError::Cancelled)
            }
            "slow" => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(150)) => Ok(Self::ok(&request)),
                    _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
                }
            }
            "stubborn" => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Self::ok(&request))
            }
            "panic" => panic!("runtime blew up"),
            _ => Ok(Self::ok(&request)),
        }
    }
}

fn staged_files(input_dir: &std::path::Path) -> Vec<String> {
    let mut found = Vec::new();
    let Ok(slots) = std::fs::read_dir(input_dir) else {
        return found;
    };
    for slot in slots.flatten().filter(|e| e.path().is_dir()) {
        for file in std::fs::read_dir(slot.path()).unwrap().flatten() {
            found.push(format!(
                "{}/{}",
                slot.file_name().to_string_lossy(),
                file.file_name().to_string_lossy()
            ));
        }
    }
    found.sort();
    found
}

pub fn test_config() -> QueueConfig {
    QueueConfig {
        max_concurrent: 1,
        max_retries: 2,
        retry_backoff: Duration::from_millis(10),
        default_timeout: Duration::from_secs(5),
        container_binary: "docker".into(),
    }
}

/// Every collaborator of the engine, rooted in a temporary directory.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub tracker: Arc<StatusTracker>,
    pub registry: Arc<ServiceRegistry>,
    pub results: ResultStore,
    pub queue: JobQueue,
    pub engine: WorkflowEngine,
    pub runtime: Arc<ScriptedRuntime>,
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: QueueConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = StoragePaths::new(dir.path());
    paths.ensure_layout().await.unwrap();

    let tracker = Arc::new(StatusTracker::new(paths.clone()));
    let registry = Arc::new(ServiceRegistry::load(paths.clone()).await.unwrap());
    let results = ResultStore::new(paths);
    let runtime = Arc::new(ScriptedRuntime::default());
    let queue = JobQueue::new(config, runtime.clone(), tracker.clone(), results.clone());
    let engine = WorkflowEngine::new(registry.clone(), queue.clone(), tracker.clone(), results.clone());

    Harness {
        dir,
        tracker,
        registry,
        results,
        queue,
        engine,
        runtime,
    }
}

impl Harness {
    /// Register an algorithm whose image drives [`ScriptedRuntime`].
    pub async fn algorithm(&self, name: &str, image: &str) -> ServiceEntry {
        self.algorithm_with_timeout(name, image, None).await
    }

    pub async fn algorithm_with_timeout(
        &self,
        name: &str,
        image: &str,
        timeout_secs: Option<u64>,
    ) -> ServiceEntry {
        let spec = ExecutionSpec {
            image: image.into(),
            command: vec![],
            timeout_secs,
        };
        self.engine
            .register_algorithm(name, "1.0", spec, None)
            .await
            .unwrap()
    }

    /// Poll until `id` reaches a terminal status.
    pub async fn settled(&self, id: EntityId) -> Tracked {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let tracked = self.engine.status(id).await.unwrap();
            let finished = match &tracked {
                Tracked::Process(p) => p.is_terminal(),
                Tracked::WorkflowRun(r) => r.is_settled() && r.status.is_terminal(),
            };
            if finished {
                return tracked;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} did not settle: {:?}",
                tracked.status()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the process `id` has the given status.
    pub async fn wait_for_status(&self, id: EntityId, predicate: impl Fn(&StatusRecord) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let tracked = self.engine.status(id).await.unwrap();
            if predicate(tracked.status()) {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "{id} never matched");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn process(tracked: Tracked) -> imgflow_core::process::Process {
    match tracked {
        Tracked::Process(p) => p,
        other => panic!("expected a process, got {other:?}"),
    }
}

pub fn run(tracked: Tracked) -> imgflow_core::process::WorkflowRun {
    match tracked {
        Tracked::WorkflowRun(r) => r,
        other => panic!("expected a workflow run, got {other:?}"),
    }
}
