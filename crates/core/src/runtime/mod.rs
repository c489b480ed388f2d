//! Container runtime collaborator.
//!
//! Defines [`ContainerRuntime`], the seam between the job queue and whatever
//! actually runs an algorithm image, along with [`ExecutionRequest`],
//! [`ExecutionOutput`], and [`ExecutionError`]. [`docker::DockerRuntime`] is
//! the production implementation; tests plug in scripted fakes.

pub mod docker;
pub mod subprocess;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::EntityId;

/// Everything the runtime needs to execute one process.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub process_id: EntityId,
    /// Container image reference.
    pub image: String,
    /// Command and arguments run inside the container.
    pub command: Vec<String>,
    /// JSON payload piped to the container's stdin.
    pub inputs: Value,
    /// Host folder mounted read-only as `/input`.
    pub input_dir: PathBuf,
    /// Host folder mounted as `/output`.
    pub output_dir: PathBuf,
    /// Maximum wall-clock time before the container is killed.
    pub timeout: Duration,
}

/// Captured output from a finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Stdout parsed as JSON, or `None` if stdout is not valid JSON.
    pub parsed_output: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Image pull or file transfer failed. Worth retrying.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Container exited with code {exit_code}: {stderr}")]
    Exited { exit_code: i32, stderr: String },

    #[error("Execution timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Failed to spawn container: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Only transfer errors are retried; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transfer(_))
    }

    /// Captured stderr, when the error carries any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Exited { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Runs algorithm images.
///
/// Implementations must honour `cancel`: once it fires, stop the container
/// and return [`ExecutionError::Cancelled`] as soon as practical.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
