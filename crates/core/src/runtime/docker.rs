//! Docker-compatible container runtime.
//!
//! Runs `<binary> run --rm --name imgflow-<id> -v <input>:/input:ro
//! -v <output>:/output <image> <command...>`. Any CLI that accepts the same
//! arguments (podman, nerdctl) works through `CONTAINER_BINARY`.

use std::path::Path;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::subprocess::run_command;
use super::{ContainerRuntime, ExecutionError, ExecutionOutput, ExecutionRequest};
use crate::types::EntityId;

/// Exit code the docker CLI uses for its own failures (daemon, pull, flags).
const DOCKER_CLI_FAILURE: i32 = 125;

/// Stderr fragments that mark a docker CLI failure as a transfer problem.
const TRANSFER_MARKERS: &[&str] = &[
    "pull access denied",
    "error pulling image",
    "manifest unknown",
    "TLS handshake timeout",
    "connection refused",
    "i/o timeout",
];

pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn container_name(process_id: EntityId) -> String {
        format!("imgflow-{process_id}")
    }

    /// Arguments passed to the CLI for one execution.
    pub fn run_args(request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            Self::container_name(request.process_id),
            "-v".to_string(),
            format!("{}:/input:ro", request.input_dir.display()),
            "-v".to_string(),
            format!("{}:/output", request.output_dir.display()),
            request.image.clone(),
        ];
        args.extend(request.command.iter().cloned());
        args
    }

    /// Best-effort `<binary> kill imgflow-<id>`.
    async fn kill(&self, process_id: EntityId) {
        let name = Self::container_name(process_id);
        match Command::new(&self.binary)
            .arg("kill")
            .arg(&name)
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                tracing::info!(container = %name, "Container killed");
            }
            Ok(out) => {
                tracing::warn!(
                    container = %name,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "Container kill reported failure",
                );
            }
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "Failed to run container kill");
            }
        }
    }
}

fn classify_exit(output: ExecutionOutput) -> Result<ExecutionOutput, ExecutionError> {
    if output.exit_code == 0 {
        return Ok(output);
    }
    if output.exit_code == DOCKER_CLI_FAILURE
        && TRANSFER_MARKERS.iter().any(|m| output.stderr.contains(m))
    {
        return Err(ExecutionError::Transfer(output.stderr.trim().to_string()));
    }
    Err(ExecutionError::Exited {
        exit_code: output.exit_code,
        stderr: output.stderr,
    })
}

async fn ensure_dir(path: &Path) -> Result<(), ExecutionError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(ExecutionError::Spawn)
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        ensure_dir(&request.input_dir).await?;
        ensure_dir(&request.output_dir).await?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::run_args(&request));

        tracing::debug!(
            process_id = %request.process_id,
            image = %request.image,
            timeout_secs = request.timeout.as_secs(),
            "Starting container",
        );

        let result = run_command(&mut cmd, &request.inputs, request.timeout, &cancel).await;

        match result {
            Ok(output) => classify_exit(output),
            Err(e @ (ExecutionError::Timeout { .. } | ExecutionError::Cancelled)) => {
                // Dropping the CLI client does not stop the container itself.
                self.kill(request.process_id).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
