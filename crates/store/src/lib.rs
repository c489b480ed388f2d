//! Durable, file-backed state for imgflow.
//!
//! Everything lives under one data root (see [`paths::StoragePaths`]).
//! Snapshots are replaced atomically so readers never observe a partial
//! write, and every read-modify-write is serialized per entity.

pub mod collections;
pub mod fs_atomic;
pub mod keyed_lock;
pub mod paths;
pub mod registry;
pub mod results;
pub mod retry;
pub mod status_store;

pub use collections::{CollectionManager, FileFetcher, FileSource, HttpFetcher};
pub use paths::StoragePaths;
pub use registry::ServiceRegistry;
pub use results::{ProcessDirs, ResultStore};
pub use retry::{with_io_retry, RetryPolicy};
pub use status_store::{EntityKey, StatusTracker};
