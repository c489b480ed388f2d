//! Execution pipeline: the job queue that runs algorithm processes and the
//! workflow engine that registers workflows and drives their runs.

pub mod config;
pub mod engine;
pub mod queue;

pub use config::QueueConfig;
pub use engine::{Execution, Tracked, WorkflowEngine};
pub use queue::{Admission, CancelOutcome, JobQueue};
