//! The service registry: every algorithm and workflow ever registered.
//!
//! State is loaded once and owned by [`ServiceRegistry`]. All mutations run
//! inside one `tokio::sync::Mutex` critical section and commit by cloning
//! the state, applying the change, persisting `services.json` and
//! `root.json` atomically, and only then publishing the new state. A failed
//! commit leaves the in-memory state untouched.

use std::path::PathBuf;

use imgflow_core::error::CoreError;
use imgflow_core::naming::{normalize_path, validate_name};
use imgflow_core::service::{RootIndexEntry, ServiceEntry, ServiceKind};
use imgflow_core::status::StatusRecord;
use imgflow_core::types::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::fs_atomic::{read_json, remove_dir_if_exists, write_json};
use crate::paths::StoragePaths;

/// Contents of `services.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryState {
    services: Vec<ServiceEntry>,
}

impl RegistryState {
    /// Name and version are unique across kinds among active entries.
    fn active_by_identity(&self, name: &str, version: &str) -> Option<usize> {
        self.services
            .iter()
            .position(|s| s.is_active() && s.same_identity(name, version))
    }

    fn position(&self, id: EntityId) -> Option<usize> {
        self.services.iter().position(|s| s.identifier == id)
    }

    fn root_index(&self) -> RootIndex {
        RootIndex {
            entries: self
                .services
                .iter()
                .filter(|s| s.is_active())
                .map(RootIndexEntry::from)
                .collect(),
        }
    }
}

/// Contents of `root.json`: the discoverable entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootIndex {
    entries: Vec<RootIndexEntry>,
}

pub struct ServiceRegistry {
    paths: StoragePaths,
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    /// Load the registry from disk. A missing `services.json` is an empty
    /// registry.
    pub async fn load(paths: StoragePaths) -> Result<Self, CoreError> {
        let state: RegistryState = read_json(&paths.services_file()).await?.unwrap_or_default();
        tracing::info!(
            services = state.services.len(),
            root = %paths.root().display(),
            "Service registry loaded",
        );
        Ok(Self {
            paths,
            state: Mutex::new(state),
        })
    }

    /// Active entry at `path`.
    pub async fn lookup_by_path(&self, path: &str) -> Result<ServiceEntry, CoreError> {
        let path = normalize_path(path);
        let state = self.state.lock().await;
        state
            .services
            .iter()
            .find(|s| s.is_active() && s.path == path)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Service", &path))
    }

    /// Entry by identifier, including tombstoned ones.
    pub async fn get(&self, id: EntityId) -> Result<ServiceEntry, CoreError> {
        let state = self.state.lock().await;
        state
            .position(id)
            .map(|i| state.services[i].clone())
            .ok_or_else(|| CoreError::not_found("Service", id))
    }

    /// Active entries, optionally filtered by kind.
    pub async fn list(&self, kind: Option<ServiceKind>) -> Vec<ServiceEntry> {
        let state = self.state.lock().await;
        state
            .services
            .iter()
            .filter(|s| s.is_active() && kind.map_or(true, |k| s.kind == k))
            .cloned()
            .collect()
    }

    /// Every entry ever registered, tombstones included.
    pub async fn snapshot(&self) -> Vec<ServiceEntry> {
        self.state.lock().await.services.clone()
    }

    /// Register `entry`, optionally persisting `descriptor` as its info file.
    ///
    /// Fails with `Duplicate` if an active, available entry with the same
    /// name and version exists, whatever its kind. An active entry that is not available
    /// is superseded (tombstoned) in the same commit.
    pub async fn register(
        &self,
        entry: ServiceEntry,
        descriptor: Option<&Value>,
    ) -> Result<ServiceEntry, CoreError> {
        validate_name("name", &entry.name)?;
        validate_name("version", &entry.version)?;

        let mut state = self.state.lock().await;
        let mut next = state.clone();

        if let Some(i) = next.active_by_identity(&entry.name, &entry.version) {
            let existing = &mut next.services[i];
            if existing.is_available() {
                return Err(CoreError::Duplicate {
                    kind: existing.kind,
                    name: existing.name.clone(),
                    version: existing.version.clone(),
                    identifier: existing.identifier,
                    status: existing.status.clone(),
                });
            }
            tracing::info!(
                superseded = %existing.identifier,
                path = %existing.path,
                "Superseding unavailable service entry",
            );
            existing.status = StatusRecord::tombstoned();
        }
        next.services.push(entry.clone());

        let descriptor_file = match descriptor {
            Some(value) => {
                let file = self
                    .paths
                    .descriptor_file(entry.kind, &entry.name, &entry.version);
                write_json(&file, value).await?;
                Some(file)
            }
            None => None,
        };

        if let Err(e) = self.persist(&next, &state).await {
            if let Some(file) = descriptor_file {
                let _ = tokio::fs::remove_file(&file).await;
            }
            return Err(e);
        }
        *state = next;

        tracing::info!(
            service_id = %entry.identifier,
            path = %entry.path,
            kind = %entry.kind,
            "Service registered",
        );
        Ok(entry)
    }

    /// Tombstone an entry, drop it from the root index and prune its
    /// descriptor. Deleting an already tombstoned entry is a no-op.
    pub async fn soft_delete(&self, id: EntityId) -> Result<ServiceEntry, CoreError> {
        let mut state = self.state.lock().await;
        let i = state
            .position(id)
            .ok_or_else(|| CoreError::not_found("Service", id))?;
        if !state.services[i].is_active() {
            return Ok(state.services[i].clone());
        }

        let mut next = state.clone();
        next.services[i].status = StatusRecord::tombstoned();
        self.persist(&next, &state).await?;
        *state = next;
        let entry = state.services[i].clone();
        drop(state);

        let dir = self
            .paths
            .descriptor_dir(entry.kind, &entry.name, &entry.version);
        if let Err(e) = remove_dir_if_exists(&dir).await {
            tracing::warn!(service_id = %id, error = %e, "Failed to prune descriptor");
        }
        tracing::info!(service_id = %id, path = %entry.path, "Service tombstoned");
        Ok(entry)
    }

    /// Replace the status of an active entry.
    pub async fn update_status(
        &self,
        id: EntityId,
        status: StatusRecord,
    ) -> Result<ServiceEntry, CoreError> {
        let mut state = self.state.lock().await;
        let i = state
            .position(id)
            .ok_or_else(|| CoreError::not_found("Service", id))?;
        if !state.services[i].is_active() {
            return Err(CoreError::Conflict(format!(
                "Service {id} is tombstoned and cannot change status"
            )));
        }
        if status.is_tombstoned() {
            return Err(CoreError::Conflict(
                "Use soft delete to tombstone a service".to_string(),
            ));
        }
        let mut next = state.clone();
        next.services[i].status = status;
        self.persist(&next, &state).await?;
        *state = next;
        Ok(state.services[i].clone())
    }

    /// Persisted descriptor of an entry, if one was written.
    pub async fn descriptor(&self, entry: &ServiceEntry) -> Result<Option<Value>, CoreError> {
        read_json(&self.descriptor_path(entry)).await
    }

    pub fn descriptor_path(&self, entry: &ServiceEntry) -> PathBuf {
        self.paths
            .descriptor_file(entry.kind, &entry.name, &entry.version)
    }

    /// Write `services.json` then `root.json`. If the second write fails the
    /// first is rolled back to `previous`.
    async fn persist(&self, next: &RegistryState, previous: &RegistryState) -> Result<(), CoreError> {
        write_json(&self.paths.services_file(), next).await?;
        if let Err(e) = write_json(&self.paths.root_index_file(), &next.root_index()).await {
            if let Err(rollback) = write_json(&self.paths.services_file(), previous).await {
                tracing::error!(error = %rollback, "Failed to roll back services.json");
            }
            return Err(e);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
