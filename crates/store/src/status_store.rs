//! Durable status snapshots with serialized read-modify-write.
//!
//! [`StatusTracker`] stores one JSON snapshot per entity. Writers for the
//! same entity are serialized through a [`KeyedMutex`]; readers take no
//! lock because every write replaces the file atomically.

use std::fmt;
use std::path::PathBuf;

use imgflow_core::error::CoreError;
use imgflow_core::types::EntityId;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::fs_atomic::{io_error, read_json, write_json};
use crate::keyed_lock::KeyedMutex;
use crate::paths::StoragePaths;

/// Identifies one status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Process(EntityId),
    Run(EntityId),
    Collection(String),
}

impl EntityKey {
    fn entity(&self) -> &'static str {
        match self {
            Self::Process(_) => "Process",
            Self::Run(_) => "Workflow run",
            Self::Collection(_) => "Collection",
        }
    }

    fn path(&self, paths: &StoragePaths) -> PathBuf {
        match self {
            Self::Process(id) => paths.process_status_file(*id),
            Self::Run(id) => paths.run_status_file(*id),
            Self::Collection(name) => paths.collection_file(name),
        }
    }

    fn not_found(&self) -> CoreError {
        CoreError::not_found(self.entity(), self.to_string())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(id) | Self::Run(id) => write!(f, "{id}"),
            Self::Collection(name) => f.write_str(name),
        }
    }
}

pub struct StatusTracker {
    paths: StoragePaths,
    locks: KeyedMutex<EntityKey>,
}

impl StatusTracker {
    pub fn new(paths: StoragePaths) -> Self {
        Self {
            paths,
            locks: KeyedMutex::new(),
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Write the first snapshot. Fails with `Conflict` if one exists.
    pub async fn create<T: Serialize>(&self, key: &EntityKey, initial: &T) -> Result<(), CoreError> {
        let _guard = self.locks.lock(key).await;
        let path = key.path(&self.paths);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))?
        {
            return Err(CoreError::Conflict(format!(
                "{} {key} already exists",
                key.entity()
            )));
        }
        write_json(&path, initial).await
    }

    /// Read the current snapshot.
    pub async fn read<T: DeserializeOwned>(&self, key: &EntityKey) -> Result<T, CoreError> {
        self.try_read(key).await?.ok_or_else(|| key.not_found())
    }

    pub async fn try_read<T: DeserializeOwned>(
        &self,
        key: &EntityKey,
    ) -> Result<Option<T>, CoreError> {
        read_json(&key.path(&self.paths)).await
    }

    /// Read-modify-write one snapshot.
    ///
    /// If `mutator` fails nothing is written and its error is returned.
    /// Returns the new snapshot and whatever the mutator returned.
    pub async fn update<T, R, F>(&self, key: &EntityKey, mutator: F) -> Result<(T, R), CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<R, CoreError>,
    {
        let _guard = self.locks.lock(key).await;
        let path = key.path(&self.paths);
        let mut current: T = read_json(&path).await?.ok_or_else(|| key.not_found())?;
        let out = mutator(&mut current)?;
        write_json(&path, &current).await?;
        Ok((current, out))
    }

    /// Create or replace a snapshot under the entity lock. `build` sees the
    /// existing snapshot, if any.
    pub async fn upsert<T, F>(&self, key: &EntityKey, build: F) -> Result<T, CoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T, CoreError>,
    {
        let _guard = self.locks.lock(key).await;
        let path = key.path(&self.paths);
        let existing: Option<T> = read_json(&path).await?;
        let next = build(existing)?;
        write_json(&path, &next).await?;
        Ok(next)
    }

    /// Identifiers of every persisted process snapshot.
    pub async fn process_ids(&self) -> Result<Vec<EntityId>, CoreError> {
        self.list_ids(self.paths.process_status_dir()).await
    }

    /// Identifiers of every persisted workflow-run snapshot.
    pub async fn run_ids(&self) -> Result<Vec<EntityId>, CoreError> {
        self.list_ids(self.paths.run_status_dir()).await
    }

    async fn list_ids(&self, dir: PathBuf) -> Result<Vec<EntityId>, CoreError> {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse() {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
