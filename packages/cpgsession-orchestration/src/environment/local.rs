//! Host-process backend
//!
//! Commands run directly on the host with the session workspace as their
//! working directory. Used for development and tests; it provides directory
//! isolation only, no resource limits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::process::run_with_timeout;
use super::{EnvironmentBackend, ExecutionEnvironment};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Default)]
pub struct LocalProcessBackend;

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EnvironmentBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn handle_for(&self, session_id: &str) -> String {
        format!("local-{}", session_id)
    }

    fn guest_workspace(&self, host_workspace: &Path) -> PathBuf {
        host_workspace.to_path_buf()
    }

    fn guest_auxiliary(&self, host_auxiliary: &Path) -> PathBuf {
        host_auxiliary.to_path_buf()
    }

    async fn start(&self, env: &ExecutionEnvironment, _deadline: Duration) -> Result<()> {
        tokio::fs::create_dir_all(&env.host_workspace)
            .await
            .map_err(|e| {
                OrchestratorError::Provisioning(format!(
                    "cannot prepare workspace {}: {}",
                    env.host_workspace.display(),
                    e
                ))
            })
    }

    async fn stop(&self, _env: &ExecutionEnvironment) -> Result<()> {
        Ok(())
    }

    async fn kill_process(&self, _env: &ExecutionEnvironment, pid: u32) -> Result<()> {
        let mut command = Command::new("kill");
        command.arg("-9").arg(pid.to_string());
        // Non-zero exit means the process is already gone
        run_with_timeout(command, Duration::from_secs(10)).await?;
        Ok(())
    }

    fn command(
        &self,
        env: &ExecutionEnvironment,
        argv: &[String],
        _timeout: Option<Duration>,
        _interactive: bool,
    ) -> Command {
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]).current_dir(&env.host_workspace);
        if let Some(aux) = &env.auxiliary_path {
            command.env("CPGSESSION_AUXILIARY", aux);
        }
        command
    }
}
