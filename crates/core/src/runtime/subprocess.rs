//! Shared subprocess management.
//!
//! [`run_command`] spawns a prepared [`tokio::process::Command`], pipes a
//! JSON payload to stdin, captures stdout/stderr, and enforces both the
//! timeout and the cancellation token. Exit codes are reported, not judged;
//! the caller decides what a non-zero exit means.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ExecutionError, ExecutionOutput};

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Spawn `cmd`, write `stdin_payload` to its stdin, and wait for it to exit.
///
/// On timeout or cancellation the child is dropped, which kills it because
/// `kill_on_drop(true)` is set.
pub async fn run_command(
    cmd: &mut Command,
    stdin_payload: &Value,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExecutionOutput, ExecutionError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(ExecutionError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        let json_bytes = serde_json::to_vec(stdin_payload).unwrap_or_default();
        // The process may close stdin early; that is not an error.
        let _ = stdin.write_all(&json_bytes).await;
        drop(stdin);
    }

    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let status = tokio::select! {
        waited = tokio::time::timeout(timeout, child.wait()) => match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(ExecutionError::Spawn(e)),
            Err(_elapsed) => {
                return Err(ExecutionError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
        },
        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
    let parsed_output = serde_json::from_str(stdout.trim()).ok();

    Ok(ExecutionOutput {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
        duration_ms,
        parsed_output,
    })
}

/// Read an entire output stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
