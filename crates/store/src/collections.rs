//! Collection manager: named batches of input files.
//!
//! Every mutation of a collection goes through the [`StatusTracker`] key for
//! that collection, so concurrent arrivals never lose an increment and the
//! flip to "available" happens exactly once. Downloads run as a supervised
//! background task on the manager's [`TaskTracker`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use imgflow_core::collection::{Collection, CollectionFile};
use imgflow_core::error::{CoreError, ValidationKind};
use imgflow_core::naming::validate_name;
use imgflow_core::status::StatusRecord;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;

use crate::fs_atomic::{atomic_write_file, io_error, remove_dir_if_exists};
use crate::paths::StoragePaths;
use crate::status_store::{EntityKey, StatusTracker};

/// Fetch attempts per file before the collection is failed.
const FETCH_ATTEMPTS: u32 = 3;

/// Linear backoff step between fetch attempts.
const FETCH_BACKOFF: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// One remote file to download into a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSource {
    pub url: String,
    /// Stored file name. Defaults to the last URL path segment.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network-level failure or a 5xx answer. Worth retrying.
    #[error("Transfer of {url} failed: {reason}")]
    Transfer { url: String, reason: String },

    #[error("Fetching {url} was rejected with status {status}")]
    Rejected { url: String, status: u16 },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }
}

/// Why a background download stopped.
#[derive(Debug, thiserror::Error)]
enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] CoreError),
}

/// Source of remote file contents.
#[async_trait::async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// [`FileFetcher`] backed by a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl FileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let transfer = |reason: String| FetchError::Transfer {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transfer(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(transfer(format!("server answered {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transfer(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Stored file name for the `index`-th source (1-based).
fn file_name_for(source: &FileSource, index: usize) -> Result<String, CoreError> {
    let name = match &source.name {
        Some(name) => name.clone(),
        None => {
            let url = reqwest::Url::parse(&source.url).map_err(|e| {
                CoreError::validation(
                    ValidationKind::Malformed,
                    format!("invalid url '{}': {e}", source.url),
                )
            })?;
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("input{index}"))
        }
    };
    validate_name("file name", &name)?;
    Ok(name)
}

/// Give every planned file a distinct stored name. A repeated name gets a
/// counter before its extension: `page.png`, `page-2.png`, `page-3.png`.
fn dedupe_file_names(names: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            if taken.insert(name.clone()) {
                return name;
            }
            let (stem, ext) = match name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
                _ => (name.clone(), String::new()),
            };
            let mut counter = 2;
            loop {
                let candidate = format!("{stem}-{counter}{ext}");
                if taken.insert(candidate.clone()) {
                    return candidate;
                }
                counter += 1;
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CollectionManager {
    paths: StoragePaths,
    tracker: Arc<StatusTracker>,
    downloads: TaskTracker,
}

impl CollectionManager {
    pub fn new(tracker: Arc<StatusTracker>) -> Self {
        Self {
            paths: tracker.paths().clone(),
            tracker,
            downloads: TaskTracker::new(),
        }
    }

    fn key(name: &str) -> EntityKey {
        EntityKey::Collection(name.to_string())
    }

    /// Start a collection expecting `total_files` files.
    ///
    /// A tombstoned collection of the same name is replaced; a live one is
    /// a `Conflict`.
    pub async fn initialize(&self, name: &str, total_files: u32) -> Result<Collection, CoreError> {
        validate_name("collection name", name)?;
        let collection = self
            .tracker
            .upsert(&Self::key(name), |existing: Option<Collection>| {
                match existing {
                    Some(c) if !c.status.is_tombstoned() => Err(CoreError::Conflict(format!(
                        "Collection '{name}' already exists"
                    ))),
                    _ => Ok(Collection::new(name, total_files)),
                }
            })
            .await?;
        let files_dir = self.paths.collection_files_dir(name);
        tokio::fs::create_dir_all(&files_dir)
            .await
            .map_err(|e| io_error(&files_dir, e))?;
        tracing::info!(collection = %name, total_files, "Collection initialized");
        Ok(collection)
    }

    /// Record one arrived file. Flips the collection to available on the
    /// last expected file.
    pub async fn record_file_arrived(
        &self,
        name: &str,
        file: CollectionFile,
    ) -> Result<Collection, CoreError> {
        let (collection, flipped) = self
            .tracker
            .update(&Self::key(name), |c: &mut Collection| c.record_arrival(file))
            .await?;
        if flipped {
            tracing::info!(collection = %name, files = collection.downloaded, "Collection is available");
        }
        Ok(collection)
    }

    /// Write `bytes` as `file_name` into the collection's folder, then
    /// record the arrival.
    pub async fn store_file(
        &self,
        name: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Collection, CoreError> {
        validate_name("file name", file_name)?;
        self.get(name).await?;
        let path = self.paths.collection_files_dir(name).join(file_name);
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write_file(&target, &bytes))
            .await
            .map_err(|e| io_error(&path, std::io::Error::other(e)))?
            .map_err(|e| io_error(&path, e))?;
        self.record_file_arrived(
            name,
            CollectionFile {
                filename: file_name.to_string(),
                path,
            },
        )
        .await
    }

    pub async fn expand(&self, name: &str, additional: u32) -> Result<Collection, CoreError> {
        let (collection, ()) = self
            .tracker
            .update(&Self::key(name), |c: &mut Collection| c.expand(additional))
            .await?;
        Ok(collection)
    }

    /// Tombstone the collection and remove its files.
    pub async fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.tracker
            .update(&Self::key(name), |c: &mut Collection| {
                if c.status.is_tombstoned() {
                    return Err(CoreError::not_found("Collection", &c.name));
                }
                c.status = StatusRecord::tombstoned();
                Ok(())
            })
            .await?;
        remove_dir_if_exists(&self.paths.collection_files_dir(name)).await?;
        tracing::info!(collection = %name, "Collection deleted");
        Ok(())
    }

    /// Live collection by name. Tombstoned collections are `NotFound`.
    pub async fn get(&self, name: &str) -> Result<Collection, CoreError> {
        let collection: Collection = self.tracker.read(&Self::key(name)).await?;
        if collection.status.is_tombstoned() {
            return Err(CoreError::not_found("Collection", name));
        }
        Ok(collection)
    }

    pub async fn status(&self, name: &str) -> Result<StatusRecord, CoreError> {
        Ok(self.get(name).await?.status)
    }

    pub async fn files(&self, name: &str) -> Result<Vec<CollectionFile>, CoreError> {
        Ok(self.get(name).await?.files)
    }

    /// Initialize a collection for `sources` and download them in the
    /// background. Returns the freshly initialized record.
    ///
    /// File names are validated up front; a bad source rejects the whole
    /// request before anything is written. Sources that would share a stored
    /// name are given distinct ones.
    pub async fn download(
        &self,
        name: &str,
        sources: Vec<FileSource>,
        fetcher: Arc<dyn FileFetcher>,
    ) -> Result<Collection, CoreError> {
        let names = sources
            .iter()
            .enumerate()
            .map(|(i, source)| file_name_for(source, i + 1))
            .collect::<Result<Vec<_>, _>>()?;
        let planned: Vec<(FileSource, String)> =
            sources.into_iter().zip(dedupe_file_names(names)).collect();

        let collection = self.initialize(name, planned.len() as u32).await?;

        let manager = self.clone();
        let name = name.to_string();
        self.downloads.spawn(async move {
            if let Err(e) = manager.run_download(&name, planned, fetcher.as_ref()).await {
                tracing::error!(collection = %name, error = %e, "Collection download failed");
                let message = e.to_string();
                let failed = manager
                    .tracker
                    .update(&Self::key(&name), |c: &mut Collection| {
                        c.fail(message);
                        Ok(())
                    })
                    .await;
                if let Err(e) = failed {
                    tracing::error!(collection = %name, error = %e, "Failed to record download failure");
                }
            }
        });
        Ok(collection)
    }

    async fn run_download(
        &self,
        name: &str,
        planned: Vec<(FileSource, String)>,
        fetcher: &dyn FileFetcher,
    ) -> Result<(), DownloadError> {
        for (source, file_name) in planned {
            let bytes = fetch_with_retry(fetcher, &source.url).await?;
            self.store_file(name, &file_name, bytes).await?;
            tracing::debug!(collection = %name, file = %file_name, "File downloaded");
        }
        Ok(())
    }

    /// Stop accepting downloads and wait for the running ones.
    pub async fn shutdown(&self) {
        self.downloads.close();
        self.downloads.wait().await;
    }
}

async fn fetch_with_retry(fetcher: &dyn FileFetcher, url: &str) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 1;
    loop {
        match fetcher.fetch(url).await {
            Err(e) if e.is_transient() && attempt < FETCH_ATTEMPTS => {
                tracing::warn!(url, attempt, error = %e, "Fetch failed, retrying");
                tokio::time::sleep(FETCH_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
