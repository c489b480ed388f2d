//! Process results and diagnostics.
//!
//! A result is written to `result_temp.json`, fsynced, and renamed to
//! `result.json`. A result therefore either exists completely or not at all.

use std::path::{Path, PathBuf};

use imgflow_core::error::CoreError;
use imgflow_core::types::EntityId;
use serde_json::Value;

use crate::fs_atomic::{copy_dir_all, io_error, read_json, write_then_rename};
use crate::paths::StoragePaths;

/// Host folders mounted into a process's container.
#[derive(Debug, Clone)]
pub struct ProcessDirs {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ResultStore {
    paths: StoragePaths,
}

impl ResultStore {
    pub fn new(paths: StoragePaths) -> Self {
        Self { paths }
    }

    /// Create the input and output folders of a process.
    pub async fn prepare(&self, id: EntityId) -> Result<ProcessDirs, CoreError> {
        let dirs = ProcessDirs {
            input: self.paths.input_dir(id),
            output: self.paths.output_dir(id),
        };
        for dir in [&dirs.input, &dirs.output] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error(dir, e))?;
        }
        Ok(dirs)
    }

    /// Publish the result of a process. Returns the final location.
    pub async fn publish(&self, id: EntityId, result: &Value) -> Result<PathBuf, CoreError> {
        let final_path = self.paths.result_file(id);
        let temp_path = self.paths.result_temp_file(id);
        let bytes = serde_json::to_vec_pretty(result).map_err(|source| CoreError::Serialization {
            path: final_path.display().to_string(),
            source,
        })?;

        let (tmp, dst) = (temp_path.clone(), final_path.clone());
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_then_rename(&tmp, &dst, &bytes)
        })
        .await
        .map_err(|e| io_error(&final_path, std::io::Error::other(e)))?
        .map_err(|e| io_error(&final_path, e))?;

        Ok(final_path)
    }

    /// Published result of a process.
    pub async fn read(&self, id: EntityId) -> Result<Value, CoreError> {
        read_json(&self.paths.result_file(id))
            .await?
            .ok_or_else(|| CoreError::not_found("Result", id))
    }

    /// Read a published result from a known location.
    pub async fn read_at(&self, location: &Path) -> Result<Value, CoreError> {
        read_json(location)
            .await?
            .ok_or_else(|| CoreError::not_found("Result", location.display()))
    }

    /// Copy a published result into a process's input folder as
    /// `{slot}.json`. Returns the staged path.
    pub async fn stage_input(
        &self,
        id: EntityId,
        slot: &str,
        source: &Path,
    ) -> Result<PathBuf, CoreError> {
        let dest = self.paths.input_dir(id).join(format!("{slot}.json"));
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| io_error(source, e))?;
        Ok(dest)
    }

    /// Copy the output folder of `upstream` into a process's input folder
    /// as `{slot}/`, so files written by one step are visible to the next.
    /// Returns the staged folder.
    pub async fn stage_output(
        &self,
        id: EntityId,
        slot: &str,
        upstream: EntityId,
    ) -> Result<PathBuf, CoreError> {
        let source = self.paths.output_dir(upstream);
        let dest = self.paths.input_dir(id).join(slot);
        let (from, to) = (source.clone(), dest.clone());
        let copied = tokio::task::spawn_blocking(move || copy_dir_all(&from, &to))
            .await
            .map_err(|e| io_error(&source, std::io::Error::other(e)))?
            .map_err(|e| io_error(&source, e))?;
        tracing::debug!(process_id = %id, upstream = %upstream, slot, files = copied, "Upstream output staged");
        Ok(dest)
    }

    /// Write captured stderr as the diagnostic log of a process.
    pub async fn write_stderr_log(&self, id: EntityId, stderr: &str) -> Result<PathBuf, CoreError> {
        let path = self.paths.stderr_log(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        tokio::fs::write(&path, stderr)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn store() -> (tempfile::TempDir, ResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(StoragePaths::new(dir.path()));
        (dir, store)
    }

    #[tokio::test]
    async fn publish_leaves_only_final_file() {
        let (_dir, store) = store();
        let id = uuid::Uuid::new_v4();
        let location = store.publish(id, &json!({"pages": 2})).await.unwrap();
        assert!(location.ends_with("result.json"));
        assert!(!location.with_file_name("result_temp.json").exists());
        assert_eq!(store.read(id).await.unwrap()["pages"], 2);
    }

    #[tokio::test]
    async fn missing_result_is_not_found() {
        let (_dir, store) = store();
        assert_matches!(
            store.read(uuid::Uuid::new_v4()).await,
            Err(CoreError::NotFound { entity: "Result", .. })
        );
    }

    #[tokio::test]
    async fn staged_input_is_a_copy() {
        let (_dir, store) = store();
        let upstream = uuid::Uuid::new_v4();
        let downstream = uuid::Uuid::new_v4();
        let location = store.publish(upstream, &json!({"mask": "m.png"})).await.unwrap();

        let staged = store.stage_input(downstream, "image", &location).await.unwrap();
        assert!(staged.ends_with("input/image.json"));
        assert_eq!(store.read_at(&staged).await.unwrap()["mask"], "m.png");
    }

    #[tokio::test]
    async fn staged_output_exposes_upstream_files() {
        let (dir, store) = store();
        let upstream = uuid::Uuid::new_v4();
        let downstream = uuid::Uuid::new_v4();
        let dirs = store.prepare(upstream).await.unwrap();
        std::fs::write(dirs.output.join("mask.png"), b"mask").unwrap();

        let staged = store.stage_output(downstream, "image", upstream).await.unwrap();
        assert_eq!(
            staged,
            StoragePaths::new(dir.path()).input_dir(downstream).join("image")
        );
        assert_eq!(std::fs::read(staged.join("mask.png")).unwrap(), b"mask");
    }

    #[tokio::test]
    async fn stderr_log_written() {
        let (_dir, store) = store();
        let id = uuid::Uuid::new_v4();
        let path = store.write_stderr_log(id, "exit 1").await.unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "exit 1");
    }
}
