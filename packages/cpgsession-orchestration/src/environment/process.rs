//! Child process execution with deadline and output capture

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

/// How long to keep draining pipes after the direct child is gone
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when killed at the deadline or terminated by a signal
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Last non-empty stderr line, falling back to stdout
    pub fn error_summary(&self) -> String {
        let pick = |s: &str| {
            s.lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Run `command` to completion or until `timeout`, then kill it
///
/// Non-zero exit is not an error; only spawn/wait failures are.
pub async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| OrchestratorError::internal(format!("failed to spawn process: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::internal("missing child stdout pipe"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| OrchestratorError::internal("missing child stderr pipe"))?;

    let stdout_task = tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = stdout.read_to_end(&mut out).await;
        out
    });
    let stderr_task = tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = stderr.read_to_end(&mut out).await;
        out
    });

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (Some(status?), false),
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "process deadline reached, killing");
            let _ = child.kill().await;
            (None, true)
        }
    };

    // Grandchildren may still hold the pipes open after a kill
    let stdout_bytes = drain(stdout_task).await;
    let stderr_bytes = drain(stderr_task).await;

    let exit_code = match status {
        Some(status) => status.code().unwrap_or(-1),
        None => -1,
    };
    let duration = started.elapsed();
    debug!(exit_code, timed_out, duration_ms = duration.as_millis() as u64, "process finished");

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        exit_code,
        timed_out,
        duration,
    })
}

async fn drain(task: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            Vec::new()
        }
    }
}
