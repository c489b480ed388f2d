//! On-disk layout under the data root.
//!
//! ```text
//! registry/services.json
//! registry/root.json
//! registry/descriptors/{kind}/{name}/{version}/info.json
//! status/processes/{id}.json
//! status/runs/{id}.json
//! collections/{name}/collection.json
//! collections/{name}/files/
//! results/{id}/result.json        (result_temp.json while writing)
//! results/{id}/input/
//! results/{id}/output/
//! logs/{id}/stderr.log
//! ```

use std::path::{Path, PathBuf};

use imgflow_core::error::CoreError;
use imgflow_core::service::ServiceKind;
use imgflow_core::types::EntityId;

use crate::fs_atomic::io_error;

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the top-level folders.
    pub async fn ensure_layout(&self) -> Result<(), CoreError> {
        for dir in [
            self.registry_dir(),
            self.process_status_dir(),
            self.run_status_dir(),
            self.root.join("collections"),
            self.root.join("results"),
            self.root.join("logs"),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| io_error(&dir, e))?;
        }
        Ok(())
    }

    // -- registry --

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn services_file(&self) -> PathBuf {
        self.registry_dir().join("services.json")
    }

    pub fn root_index_file(&self) -> PathBuf {
        self.registry_dir().join("root.json")
    }

    pub fn descriptor_dir(&self, kind: ServiceKind, name: &str, version: &str) -> PathBuf {
        self.registry_dir()
            .join("descriptors")
            .join(kind.collection())
            .join(name)
            .join(version)
    }

    pub fn descriptor_file(&self, kind: ServiceKind, name: &str, version: &str) -> PathBuf {
        self.descriptor_dir(kind, name, version).join("info.json")
    }

    // -- status snapshots --

    pub fn process_status_dir(&self) -> PathBuf {
        self.root.join("status").join("processes")
    }

    pub fn process_status_file(&self, id: EntityId) -> PathBuf {
        self.process_status_dir().join(format!("{id}.json"))
    }

    pub fn run_status_dir(&self) -> PathBuf {
        self.root.join("status").join("runs")
    }

    pub fn run_status_file(&self, id: EntityId) -> PathBuf {
        self.run_status_dir().join(format!("{id}.json"))
    }

    // -- collections --

    pub fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join("collections").join(name)
    }

    pub fn collection_file(&self, name: &str) -> PathBuf {
        self.collection_dir(name).join("collection.json")
    }

    pub fn collection_files_dir(&self, name: &str) -> PathBuf {
        self.collection_dir(name).join("files")
    }

    // -- results --

    pub fn result_dir(&self, id: EntityId) -> PathBuf {
        self.root.join("results").join(id.to_string())
    }

    pub fn result_file(&self, id: EntityId) -> PathBuf {
        self.result_dir(id).join("result.json")
    }

    pub fn result_temp_file(&self, id: EntityId) -> PathBuf {
        self.result_dir(id).join("result_temp.json")
    }

    pub fn input_dir(&self, id: EntityId) -> PathBuf {
        self.result_dir(id).join("input")
    }

    pub fn output_dir(&self, id: EntityId) -> PathBuf {
        self.result_dir(id).join("output")
    }

    // -- diagnostics --

    pub fn stderr_log(&self, id: EntityId) -> PathBuf {
        self.root
            .join("logs")
            .join(id.to_string())
            .join("stderr.log")
    }
}
