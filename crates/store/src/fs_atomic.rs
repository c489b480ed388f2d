//! Atomic file replacement and JSON snapshot helpers.
//!
//! A write goes to a uniquely named temp file in the target's folder, is
//! fsynced, renamed over the target, and the folder is fsynced. Readers
//! therefore see either the old or the new snapshot, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use imgflow_core::error::CoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Map an I/O error on `path` into the core taxonomy.
pub fn io_error(path: &Path, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Replace `path` with `content` atomically. Blocking.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        uuid::Uuid::new_v4().simple(),
    );
    write_then_rename(&parent.join(tmp_name), path, content)
}

/// Write `content` to `tmp_path`, fsync it, then rename it onto `path`.
/// Blocking.
///
/// Used directly when the temp file name is part of the on-disk contract
/// (e.g. `result_temp.json`).
pub fn write_then_rename(tmp_path: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(tmp_path, path) {
        let _ = fs::remove_file(tmp_path);
        return Err(e);
    }
    sync_parent_dir(parent)?;
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Copy the tree under `src` into `dst`, creating `dst`. A missing `src`
/// is an empty tree. Returns the number of files copied. Blocking.
pub fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let entries = match fs::read_dir(&from) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let target = to.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                fs::create_dir_all(&target)?;
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Async JSON helpers
// ---------------------------------------------------------------------------

/// Serialize `value` as pretty JSON and replace `path` atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| CoreError::Serialization {
        path: path.display().to_string(),
        source,
    })?;
    let target: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write_file(&target, &bytes))
        .await
        .map_err(|e| io_error(path, std::io::Error::other(e)))?
        .map_err(|e| io_error(path, e))
}

/// Read and deserialize a JSON snapshot. `Ok(None)` if the file is missing.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CoreError::Serialization {
            path: path.display().to_string(),
            source,
        })
}

/// Remove a folder tree, treating "already gone" as success.
pub async fn remove_dir_if_exists(path: &Path) -> Result<(), CoreError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
