//! Concurrency properties of the registry and the collection manager.

use std::sync::Arc;

use imgflow_core::collection::CollectionFile;
use imgflow_core::error::CoreError;
use imgflow_core::service::{ServiceEntry, ServiceKind};
use imgflow_core::status::{StatusCode, StatusRecord};
use imgflow_store::{CollectionManager, ServiceRegistry, StatusTracker, StoragePaths};

fn workflow(name: &str) -> ServiceEntry {
    ServiceEntry::new(
        ServiceKind::Workflow,
        name,
        "1",
        StatusRecord::done("workflow registered"),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_yield_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(
        ServiceRegistry::load(StoragePaths::new(dir.path()))
            .await
            .unwrap(),
    );

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.register(workflow("binarize-segment"), None).await })
        })
        .collect();

    let mut registered = 0;
    let mut duplicates = 0;
    for attempt in futures::future::join_all(attempts).await {
        match attempt.unwrap() {
            Ok(_) => registered += 1,
            Err(CoreError::Duplicate { .. }) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(registered, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(registry.list(Some(ServiceKind::Workflow)).await.len(), 1);

    // The persisted registry agrees with memory.
    let reloaded = ServiceRegistry::load(StoragePaths::new(dir.path()))
        .await
        .unwrap();
    assert_eq!(reloaded.snapshot().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_arrivals_flip_exactly_once() {
    const FILES: u32 = 40;

    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(StatusTracker::new(StoragePaths::new(dir.path())));
    let manager = CollectionManager::new(tracker);
    manager.initialize("scans", FILES).await.unwrap();

    let arrivals: Vec<_> = (0..FILES)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let file = CollectionFile {
                    filename: format!("{i}.png"),
                    path: format!("/scans/{i}.png").into(),
                };
                manager.record_file_arrived("scans", file).await.unwrap()
            })
        })
        .collect();

    let mut available_snapshots = 0;
    let mut max_seen = 0;
    for snapshot in futures::future::join_all(arrivals).await {
        let snapshot = snapshot.unwrap();
        if snapshot.status.status_code == StatusCode::Done {
            available_snapshots += 1;
            assert_eq!(snapshot.downloaded, FILES);
        } else {
            assert!(snapshot.status.percentage < 100);
        }
        max_seen = max_seen.max(snapshot.downloaded);
    }

    assert_eq!(available_snapshots, 1);
    assert_eq!(max_seen, FILES);
    let collection = manager.get("scans").await.unwrap();
    assert_eq!(collection.files.len(), FILES as usize);
    assert_eq!(collection.status.percentage, 100);
}
