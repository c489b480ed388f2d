use std::sync::Arc;

use imgflow_core::error::CoreError;
use imgflow_core::runtime::ContainerRuntime;
use imgflow_pipeline::{JobQueue, QueueConfig, WorkflowEngine};
use imgflow_store::{
    CollectionManager, FileFetcher, ResultStore, ServiceRegistry, StatusTracker, StoragePaths,
};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: every field is an `Arc` or a handle around one.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub engine: WorkflowEngine,
    pub collections: CollectionManager,
    /// Used by collection downloads.
    pub fetcher: Arc<dyn FileFetcher>,
}

impl AppState {
    /// Open the data root, load the registry, and wire the queue and engine.
    ///
    /// Processes and runs left unsettled by a previous run of the server
    /// are marked as failed before anything new is admitted.
    pub async fn build(
        config: ServerConfig,
        queue_config: QueueConfig,
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn FileFetcher>,
    ) -> Result<Self, CoreError> {
        let paths = StoragePaths::new(&config.data_root);
        paths.ensure_layout().await?;

        let registry = Arc::new(ServiceRegistry::load(paths.clone()).await?);
        let tracker = Arc::new(StatusTracker::new(paths.clone()));
        let results = ResultStore::new(paths);
        let queue = JobQueue::new(queue_config, runtime, tracker.clone(), results.clone());
        let engine = WorkflowEngine::new(registry.clone(), queue.clone(), tracker.clone(), results);
        let collections = CollectionManager::new(tracker);

        let processes = queue.recover_interrupted().await?;
        let runs = engine.recover_interrupted().await?;
        tracing::info!(
            data_root = %config.data_root.display(),
            services = registry.snapshot().await.len(),
            recovered_processes = processes,
            recovered_runs = runs,
            "Storage loaded",
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            engine,
            collections,
            fetcher,
        })
    }

    /// Stop the run drivers, the queue and the downloads, in that order.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.engine.queue().shutdown().await;
        self.collections.shutdown().await;
    }
}
