//! Subprocess runner shared by the CLI-backed providers.
//!
//! Spawns the vendor binary with piped output, forwards each stdout line to a
//! callback as it arrives (for live progress), and races everything against
//! the run's cancellation token. On cancellation the child gets SIGTERM, then
//! SIGKILL once the grace period runs out.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MeasurementError;

/// Captured output of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` to completion, handing every stdout line to `on_line`.
///
/// Non-zero exit, a missing binary and unreadable output all map to
/// [`MeasurementError::BackendFailure`]; cancellation maps to
/// [`MeasurementError::Cancelled`] once the child has been reaped.
pub async fn run_streaming<F>(
    program: &str,
    args: &[String],
    cancel: &CancellationToken,
    grace: Duration,
    mut on_line: F,
) -> Result<ProcessOutput, MeasurementError>
where
    F: FnMut(&str) + Send,
{
    debug!(%program, ?args, "spawning provider process");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MeasurementError::backend(format!("{} not found", program))
            } else {
                MeasurementError::backend(format!("failed to spawn {}: {}", program, e))
            }
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| MeasurementError::backend("stdout not captured"))?;
    let stderr = child.stderr.take();

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut buf).await;
        }
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut collected = String::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(%program, "cancellation requested, terminating provider process");
                terminate_child(&mut child, grace).await;
                stderr_task.abort();
                return Err(MeasurementError::Cancelled);
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    on_line(&line);
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok(None) => break,
                Err(e) => {
                    terminate_child(&mut child, grace).await;
                    stderr_task.abort();
                    return Err(MeasurementError::backend(format!(
                        "failed reading {} output: {}",
                        program, e
                    )));
                }
            },
        }
    }

    let status = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            terminate_child(&mut child, grace).await;
            stderr_task.abort();
            return Err(MeasurementError::Cancelled);
        }

        status = child.wait() => status
            .map_err(|e| MeasurementError::backend(format!("failed to wait for {}: {}", program, e)))?,
    };

    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = stderr.trim();
        let msg = if detail.is_empty() {
            format!("{} exited with code {}", program, code)
        } else {
            format!("{} exited with code {}: {}", program, code, detail)
        };
        return Err(MeasurementError::backend(msg));
    }

    Ok(ProcessOutput {
        stdout: collected,
        stderr,
    })
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to `grace`, then sends SIGKILL if the
/// process is still running.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}
