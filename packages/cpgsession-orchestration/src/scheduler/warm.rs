//! Long-lived engine process kept per session
//!
//! The process is driven over stdin/stdout: the scheduler writes the engine's
//! invocation text and reads lines until the per-query completion marker.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};

use tracing::warn;

use crate::environment::EnvironmentOrchestrator;
use crate::error::{OrchestratorError, Result};

/// Execution mode of a session's engine
///
/// ```text
/// WarmOk ──crash/timeout──▶ WarmSuspect ──crash──▶ ColdFallback
///    ▲                           │
///    └───────warm success────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    WarmOk,
    WarmSuspect,
    ColdFallback,
}

impl EngineMode {
    pub fn allows_warm(self) -> bool {
        !matches!(self, EngineMode::ColdFallback)
    }

    pub fn after_success(self) -> Self {
        match self {
            EngineMode::ColdFallback => EngineMode::ColdFallback,
            _ => EngineMode::WarmOk,
        }
    }

    pub fn after_crash(self) -> Self {
        match self {
            EngineMode::WarmOk => EngineMode::WarmSuspect,
            _ => EngineMode::ColdFallback,
        }
    }

    pub fn after_timeout(self) -> Self {
        match self {
            EngineMode::ColdFallback => EngineMode::ColdFallback,
            _ => EngineMode::WarmSuspect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WarmOutcome {
    Completed,
    Crashed(String),
    TimedOut,
}

pub(crate) struct WarmProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    handle_id: String,
    /// Pid inside the environment; the local child may only be a client
    guest_pid: u32,
}

impl WarmProcess {
    /// Take over a child from `spawn_interactive` and read its pid line
    pub async fn start(mut child: Child, handle_id: &str, timeout: Duration) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::internal("engine process has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::internal("engine process has no stdout pipe"))?;
        let mut stdout = BufReader::new(stdout);

        let mut line = String::new();
        let read = tokio::time::timeout(timeout, stdout.read_line(&mut line)).await;
        let guest_pid = match read {
            Ok(Ok(n)) if n > 0 => line.trim().parse::<u32>().ok(),
            _ => None,
        };
        let Some(guest_pid) = guest_pid else {
            let _ = child.kill().await;
            return Err(OrchestratorError::internal(format!(
                "engine did not report its pid (got {:?})",
                line.trim()
            )));
        };

        Ok(Self {
            child,
            stdin,
            stdout,
            handle_id: handle_id.to_string(),
            guest_pid,
        })
    }

    pub fn guest_pid(&self) -> u32 {
        self.guest_pid
    }

    /// Send one invocation and wait for `marker`
    pub async fn run(&mut self, invocation: &str, marker: &str, timeout: Duration) -> WarmOutcome {
        match self.child.try_wait() {
            Ok(Some(status)) => return WarmOutcome::Crashed(format!("engine exited ({})", status)),
            Err(e) => return WarmOutcome::Crashed(format!("engine state unknown: {}", e)),
            Ok(None) => {}
        }

        let stdin = &mut self.stdin;
        let stdout = &mut self.stdout;
        let exchange = async move {
            stdin
                .write_all(invocation.as_bytes())
                .await
                .map_err(|e| format!("write to engine failed: {}", e))?;
            stdin
                .flush()
                .await
                .map_err(|e| format!("flush to engine failed: {}", e))?;

            let mut line = String::new();
            loop {
                line.clear();
                let read = stdout
                    .read_line(&mut line)
                    .await
                    .map_err(|e| format!("read from engine failed: {}", e))?;
                if read == 0 {
                    return Err("engine output closed before completion marker".to_string());
                }
                // An echoed invocation ends with a quote or paren, never the bare marker
                if line.trim_end().ends_with(marker) {
                    return Ok(());
                }
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => WarmOutcome::TimedOut,
            Ok(Err(reason)) => WarmOutcome::Crashed(reason),
            Ok(Ok(())) => WarmOutcome::Completed,
        }
    }

    /// Kill the engine inside its environment, then the local side
    pub async fn kill(mut self, orchestrator: &EnvironmentOrchestrator) {
        if let Err(e) = orchestrator.kill_process(&self.handle_id, self.guest_pid).await {
            warn!(
                handle = %self.handle_id,
                pid = self.guest_pid,
                error = %e,
                "failed to kill engine inside environment"
            );
        }
        let _ = self.child.kill().await;
    }
}

/// Per-session engine state, guarded by a mutex in the scheduler
pub(crate) struct WarmSlot {
    pub mode: EngineMode,
    pub process: Option<WarmProcess>,
}

impl WarmSlot {
    pub fn new(persistent_enabled: bool) -> Self {
        Self {
            mode: if persistent_enabled {
                EngineMode::WarmOk
            } else {
                EngineMode::ColdFallback
            },
            process: None,
        }
    }

    pub async fn kill(&mut self, orchestrator: &EnvironmentOrchestrator) {
        if let Some(process) = self.process.take() {
            process.kill(orchestrator).await;
        }
    }
}
