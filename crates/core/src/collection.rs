//! Collection records: named batches of input files with an aggregate
//! download/availability status.
//!
//! The transition logic lives here so that it can be tested without
//! storage; the store crate serializes calls per collection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::{percentage, StatusCode, StatusRecord};
use crate::types::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionFile {
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub name: String,
    pub files: Vec<CollectionFile>,
    pub status: StatusRecord,
    pub total_files: u32,
    pub downloaded: u32,
    pub created_at: Timestamp,
}

impl Collection {
    /// A fresh collection expecting `total_files` files.
    ///
    /// An empty collection is available immediately.
    pub fn new(name: impl Into<String>, total_files: u32) -> Self {
        let mut collection = Self {
            name: name.into(),
            files: Vec::new(),
            status: StatusRecord::in_progress(String::new(), 0),
            total_files,
            downloaded: 0,
            created_at: chrono::Utc::now(),
        };
        collection.refresh_status();
        collection
    }

    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    /// Record one arrived file.
    ///
    /// Returns `true` exactly once: on the call that completes the collection.
    pub fn record_arrival(&mut self, file: CollectionFile) -> Result<bool, CoreError> {
        self.ensure_in_progress()?;
        if self.downloaded >= self.total_files {
            return Err(CoreError::Conflict(format!(
                "Collection '{}' already holds all {} files",
                self.name, self.total_files
            )));
        }
        self.downloaded += 1;
        self.files.push(file);
        Ok(self.refresh_status())
    }

    /// Raise the number of expected files while downloads are in progress.
    pub fn expand(&mut self, additional: u32) -> Result<(), CoreError> {
        self.ensure_in_progress()?;
        self.total_files = self.total_files.saturating_add(additional);
        self.refresh_status();
        Ok(())
    }

    /// Mark the collection failed, e.g. after a file could not be fetched.
    pub fn fail(&mut self, message: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = StatusRecord::new(
                StatusCode::Error,
                message,
                percentage(self.downloaded, self.total_files),
            );
        }
    }

    fn ensure_in_progress(&self) -> Result<(), CoreError> {
        match self.status.status_code {
            StatusCode::InProgress => Ok(()),
            StatusCode::Tombstoned => Err(CoreError::not_found("Collection", &self.name)),
            other => Err(CoreError::Conflict(format!(
                "Collection '{}' is no longer accepting files ({other})",
                self.name
            ))),
        }
    }

    /// Recompute the status from the counters. Returns `true` if this call
    /// flipped the collection to available.
    fn refresh_status(&mut self) -> bool {
        if self.downloaded >= self.total_files {
            let flipped = !self.status.is_available();
            self.status = StatusRecord::done("Collection is available");
            return flipped;
        }
        // Expanding the collection must not move the percentage backwards.
        let pct = percentage(self.downloaded, self.total_files).max(self.status.percentage);
        self.status = StatusRecord::in_progress(
            format!(
                "Downloaded {} of {} files",
                self.downloaded, self.total_files
            ),
            pct,
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn file(name: &str) -> CollectionFile {
        CollectionFile {
            filename: name.to_string(),
            path: PathBuf::from(format!("/files/{name}")),
        }
    }

    #[test]
    fn new_collection_in_progress() {
        let c = Collection::new("pages", 4);
        assert_eq!(c.status.status_code, StatusCode::InProgress);
        assert_eq!(c.status.percentage, 0);
        assert_eq!(c.status.status_message, "Downloaded 0 of 4 files");
    }

    #[test]
    fn empty_collection_available_immediately() {
        let c = Collection::new("empty", 0);
        assert!(c.is_available());
        assert_eq!(c.status.percentage, 100);
    }

    #[test]
    fn flips_exactly_once() {
        let mut c = Collection::new("pages", 3);
        let mut last = 0;
        let mut flips = 0;
        for i in 0..3 {
            if c.record_arrival(file(&format!("{i}.png"))).unwrap() {
                flips += 1;
            }
            assert!(c.status.percentage >= last);
            last = c.status.percentage;
        }
        assert_eq!(flips, 1);
        assert!(c.is_available());
        assert_eq!(c.status.percentage, 100);
    }

    #[test]
    fn extra_file_rejected_after_completion() {
        let mut c = Collection::new("pages", 1);
        c.record_arrival(file("a.png")).unwrap();
        assert_matches!(c.record_arrival(file("b.png")), Err(CoreError::Conflict(_)));
        assert_eq!(c.files.len(), 1);
    }

    #[test]
    fn expand_never_moves_percentage_backwards() {
        let mut c = Collection::new("pages", 2);
        c.record_arrival(file("a.png")).unwrap();
        c.expand(2).unwrap();
        assert_eq!(c.total_files, 4);
        assert_eq!(c.status.percentage, 50);
        assert_eq!(c.status.status_message, "Downloaded 1 of 4 files");
        c.record_arrival(file("b.png")).unwrap();
        assert_eq!(c.status.percentage, 50);
        c.record_arrival(file("c.png")).unwrap();
        assert_eq!(c.status.percentage, 75);
        c.record_arrival(file("d.png")).unwrap();
        assert!(c.is_available());
        assert_matches!(c.expand(1), Err(CoreError::Conflict(_)));
    }

    #[test]
    fn fail_keeps_progress() {
        let mut c = Collection::new("pages", 2);
        c.record_arrival(file("a.png")).unwrap();
        c.fail("download of b.png failed");
        assert_eq!(c.status.status_code, StatusCode::Error);
        assert_eq!(c.status.percentage, 50);
    }
}
