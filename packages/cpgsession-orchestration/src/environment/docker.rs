//! Docker CLI backend: one long-running container per session

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::process::run_with_timeout;
use super::{EnvironmentBackend, ExecutionEnvironment};
use crate::config::EnvironmentConfig;
use crate::error::{OrchestratorError, Result};

const GUEST_WORKSPACE: &str = "/workspace";
const GUEST_AUXILIARY: &str = "/playground";
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: String,
    image: String,
}

impl DockerBackend {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            docker: config.docker_binary.clone(),
            image: config.image.clone(),
        }
    }

    /// Arguments for `docker run` (without the binary)
    pub fn run_args(&self, env: &ExecutionEnvironment) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            env.handle_id.clone(),
            "--cpus".to_string(),
            format!("{}", env.limits.cpus),
            "--memory".to_string(),
            env.limits.memory.clone(),
            "-v".to_string(),
            format!("{}:{}:rw", env.host_workspace.display(), GUEST_WORKSPACE),
        ];
        if let Some(aux) = &env.auxiliary_host_path {
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", aux.display(), GUEST_AUXILIARY));
        }
        args.extend([
            "-w".to_string(),
            GUEST_WORKSPACE.to_string(),
            self.image.clone(),
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]);
        args
    }

    /// Arguments for `docker exec` (without the binary)
    pub fn exec_args(
        &self,
        env: &ExecutionEnvironment,
        argv: &[String],
        timeout: Option<Duration>,
        interactive: bool,
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.extend(["-w".to_string(), GUEST_WORKSPACE.to_string(), env.handle_id.clone()]);
        if let Some(timeout) = timeout {
            // Killing the docker client does not kill the process in the container
            args.extend([
                "timeout".to_string(),
                "-s".to_string(),
                "KILL".to_string(),
                timeout.as_secs().max(1).to_string(),
            ]);
        }
        args.extend(argv.iter().cloned());
        args
    }

    /// Arguments for killing `pid` inside the container
    pub fn kill_args(&self, env: &ExecutionEnvironment, pid: u32) -> Vec<String> {
        vec![
            "exec".to_string(),
            env.handle_id.clone(),
            "kill".to_string(),
            "-9".to_string(),
            pid.to_string(),
        ]
    }

    fn docker(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.docker);
        command.args(args);
        command
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let out = run_with_timeout(
            self.docker(vec!["rm".to_string(), "-f".to_string(), name.to_string()]),
            STOP_TIMEOUT,
        )
        .await?;
        if out.success() || out.stderr.contains("No such container") {
            return Ok(());
        }
        Err(OrchestratorError::internal(format!(
            "docker rm -f {} failed: {}",
            name,
            out.error_summary()
        )))
    }
}

#[async_trait]
impl EnvironmentBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn handle_for(&self, session_id: &str) -> String {
        format!("cpgsession-{}", session_id)
    }

    fn guest_workspace(&self, _host_workspace: &Path) -> PathBuf {
        PathBuf::from(GUEST_WORKSPACE)
    }

    fn guest_auxiliary(&self, _host_auxiliary: &Path) -> PathBuf {
        PathBuf::from(GUEST_AUXILIARY)
    }

    async fn start(&self, env: &ExecutionEnvironment, deadline: Duration) -> Result<()> {
        // A container left behind by a crashed process would block the name
        if let Err(e) = self.remove(&env.handle_id).await {
            warn!(handle = %env.handle_id, error = %e, "stale container cleanup failed");
        }

        let args = self.run_args(env);
        debug!(handle = %env.handle_id, image = %self.image, "docker run");

        let out = run_with_timeout(self.docker(args), deadline).await?;
        if out.timed_out {
            return Err(OrchestratorError::Provisioning(format!(
                "docker run did not finish within {}s",
                deadline.as_secs()
            )));
        }
        if !out.success() {
            return Err(OrchestratorError::Provisioning(format!(
                "docker run failed: {}",
                out.error_summary()
            )));
        }
        Ok(())
    }

    async fn stop(&self, env: &ExecutionEnvironment) -> Result<()> {
        self.remove(&env.handle_id).await
    }

    async fn kill_process(&self, env: &ExecutionEnvironment, pid: u32) -> Result<()> {
        let out = run_with_timeout(self.docker(self.kill_args(env, pid)), STOP_TIMEOUT).await?;
        let gone = ["No such process", "No such container", "is not running"]
            .iter()
            .any(|needle| out.stderr.contains(needle));
        if out.success() || gone {
            return Ok(());
        }
        Err(OrchestratorError::internal(format!(
            "kill of pid {} in {} failed: {}",
            pid,
            env.handle_id,
            out.error_summary()
        )))
    }

    fn command(
        &self,
        env: &ExecutionEnvironment,
        argv: &[String],
        timeout: Option<Duration>,
        interactive: bool,
    ) -> Command {
        self.docker(self.exec_args(env, argv, timeout, interactive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentState, ResourceLimits};
    use chrono::Utc;

    fn env(aux: Option<&str>) -> ExecutionEnvironment {
        ExecutionEnvironment {
            handle_id: "cpgsession-s1".to_string(),
            session_id: "s1".to_string(),
            host_workspace: PathBuf::from("/tmp/cpg/sessions/s1"),
            guest_workspace: PathBuf::from(GUEST_WORKSPACE),
            auxiliary_host_path: aux.map(PathBuf::from),
            auxiliary_path: aux.map(|_| PathBuf::from(GUEST_AUXILIARY)),
            limits: ResourceLimits {
                cpus: 1.5,
                memory: "4g".to_string(),
            },
            state: EnvironmentState::Starting,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_args_mounts_and_limits() {
        let backend = DockerBackend::new(&EnvironmentConfig::default());
        let args = backend.run_args(&env(Some("/srv/playground"))).join(" ");

        assert_eq!(
            args,
            "run -d --name cpgsession-s1 --cpus 1.5 --memory 4g \
             -v /tmp/cpg/sessions/s1:/workspace:rw -v /srv/playground:/playground:ro \
             -w /workspace joern:latest tail -f /dev/null"
        );
    }

    #[test]
    fn test_exec_args_wrap_timeout() {
        let backend = DockerBackend::new(&EnvironmentConfig::default());
        let argv = vec!["joern".to_string(), "--script".to_string(), "q.sc".to_string()];

        let bounded = backend.exec_args(&env(None), &argv, Some(Duration::from_secs(30)), false);
        assert_eq!(
            bounded.join(" "),
            "exec -w /workspace cpgsession-s1 timeout -s KILL 30 joern --script q.sc"
        );

        let interactive = backend.exec_args(&env(None), &argv, None, true);
        assert_eq!(interactive.join(" "), "exec -i -w /workspace cpgsession-s1 joern --script q.sc");
    }

    #[test]
    fn test_kill_targets_container_pid() {
        let backend = DockerBackend::new(&EnvironmentConfig::default());
        assert_eq!(
            backend.kill_args(&env(None), 4242).join(" "),
            "exec cpgsession-s1 kill -9 4242"
        );
    }
}
