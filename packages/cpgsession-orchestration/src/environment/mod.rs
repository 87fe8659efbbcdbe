//! Execution environments: one isolated sandbox per session
//!
//! The orchestrator owns admission (start slots + capacity permits) and the
//! table of running environments. Backends only know how to create, tear
//! down, and build commands for one environment.

pub mod docker;
pub mod local;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::EnvironmentConfig;
use crate::error::{OrchestratorError, Result};

pub use docker::DockerBackend;
pub use local::LocalProcessBackend;
pub use process::{run_with_timeout, CommandOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentState {
    Starting,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Fractional CPUs
    pub cpus: f64,
    /// Memory ceiling in docker notation, e.g. `4g`
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvironment {
    pub handle_id: String,
    pub session_id: String,
    pub host_workspace: PathBuf,
    /// Workspace path as the engine sees it
    pub guest_workspace: PathBuf,
    /// Shared read-only directory on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_host_path: Option<PathBuf>,
    /// Same directory as the engine sees it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_path: Option<PathBuf>,
    pub limits: ResourceLimits,
    pub state: EnvironmentState,
    pub started_at: DateTime<Utc>,
}

impl ExecutionEnvironment {
    /// Translate a host path inside the workspace to the guest view
    pub fn guest_path(&self, host_path: &Path) -> PathBuf {
        match host_path.strip_prefix(&self.host_workspace) {
            Ok(relative) => self.guest_workspace.join(relative),
            Err(_) => host_path.to_path_buf(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Backend port
// ═══════════════════════════════════════════════════════════════════════════

/// Sandbox technology behind the orchestrator
#[async_trait]
pub trait EnvironmentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle_for(&self, session_id: &str) -> String;

    fn guest_workspace(&self, host_workspace: &Path) -> PathBuf;

    fn guest_auxiliary(&self, host_auxiliary: &Path) -> PathBuf;

    /// Bring the environment up; failures become `ProvisioningError`
    async fn start(&self, env: &ExecutionEnvironment, deadline: Duration) -> Result<()>;

    /// Tear down; must succeed for unknown or already-removed environments
    async fn stop(&self, env: &ExecutionEnvironment) -> Result<()>;

    /// SIGKILL `pid` as numbered inside the environment
    ///
    /// Must succeed when the process is already gone.
    async fn kill_process(&self, env: &ExecutionEnvironment, pid: u32) -> Result<()>;

    /// Build a command running `argv` inside the environment
    ///
    /// `timeout` is `Some` for bounded runs so backends can enforce it on
    /// the far side as well; `None` for interactive processes.
    fn command(
        &self,
        env: &ExecutionEnvironment,
        argv: &[String],
        timeout: Option<Duration>,
        interactive: bool,
    ) -> Command;
}

// ═══════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

/// Prefix for interactive commands: report the pid, then become the command
///
/// The pid line is the first thing the process writes to stdout.
const INTERACTIVE_PREAMBLE: &str = "echo $$; exec \"$@\"";

struct RunningEnvironment {
    env: ExecutionEnvironment,
    /// Held until the backend confirms teardown
    _capacity: OwnedSemaphorePermit,
    teardown_failed: bool,
}

pub struct EnvironmentOrchestrator {
    backend: Arc<dyn EnvironmentBackend>,
    config: EnvironmentConfig,
    start_slots: Arc<Semaphore>,
    capacity: Arc<Semaphore>,
    running: DashMap<String, RunningEnvironment>,
}

impl EnvironmentOrchestrator {
    /// `capacity` bounds simultaneously running environments
    pub fn new(backend: Arc<dyn EnvironmentBackend>, config: EnvironmentConfig, capacity: usize) -> Self {
        Self {
            backend,
            start_slots: Arc::new(Semaphore::new(config.max_concurrent_starts.max(1))),
            capacity: Arc::new(Semaphore::new(capacity.max(1))),
            config,
            running: DashMap::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    async fn acquire(
        semaphore: &Arc<Semaphore>,
        deadline: Duration,
        what: &str,
    ) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(deadline, Arc::clone(semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(OrchestratorError::internal(format!("{} semaphore closed", what))),
            Err(_) => Err(OrchestratorError::ResourceExhausted(format!(
                "no {} available within {}s",
                what,
                deadline.as_secs()
            ))),
        }
    }

    pub async fn start(&self, session_id: &str, workspace: &Path) -> Result<ExecutionEnvironment> {
        let deadline = self.config.start_timeout();
        let _slot = Self::acquire(&self.start_slots, deadline, "environment start slot").await?;
        let capacity = Self::acquire(&self.capacity, deadline, "environment capacity").await?;

        tokio::fs::create_dir_all(workspace).await?;
        let mut env = ExecutionEnvironment {
            handle_id: self.backend.handle_for(session_id),
            session_id: session_id.to_string(),
            host_workspace: workspace.to_path_buf(),
            guest_workspace: self.backend.guest_workspace(workspace),
            auxiliary_host_path: self.config.auxiliary_path.clone(),
            auxiliary_path: self
                .config
                .auxiliary_path
                .as_deref()
                .map(|aux| self.backend.guest_auxiliary(aux)),
            limits: ResourceLimits {
                cpus: self.config.cpu_limit,
                memory: self.config.memory_limit.clone(),
            },
            state: EnvironmentState::Starting,
            started_at: Utc::now(),
        };

        if let Err(e) = self.backend.start(&env, deadline).await {
            // Partially created sandboxes are torn down best-effort
            let _ = self.backend.stop(&env).await;
            return Err(match e {
                OrchestratorError::Provisioning(_) => e,
                other => OrchestratorError::Provisioning(other.message()),
            });
        }

        env.state = EnvironmentState::Running;
        info!(
            session_id,
            handle = %env.handle_id,
            backend = self.backend.name(),
            "environment started"
        );
        self.running.insert(
            env.handle_id.clone(),
            RunningEnvironment {
                env: env.clone(),
                _capacity: capacity,
                teardown_failed: false,
            },
        );
        Ok(env)
    }

    /// Idempotent; unknown handles succeed
    ///
    /// When the backend fails, the environment keeps its capacity permit and
    /// is refused new commands; `retry_failed_stops` tries again later.
    pub async fn stop(&self, handle_id: &str) -> Result<()> {
        let Some(mut env) = self.running.get(handle_id).map(|r| r.env.clone()) else {
            debug!(handle = handle_id, "stop on unknown or stopped environment");
            return Ok(());
        };
        if let Err(e) = self.backend.stop(&env).await {
            warn!(handle = handle_id, error = %e, "environment teardown failed, capacity kept");
            if let Some(mut running) = self.running.get_mut(handle_id) {
                running.teardown_failed = true;
            }
            return Err(e);
        }
        self.running.remove(handle_id);
        env.state = EnvironmentState::Stopped;
        info!(session_id = %env.session_id, handle = handle_id, "environment stopped");
        Ok(())
    }

    /// Retry teardown of environments whose earlier stop failed
    ///
    /// # Returns
    ///
    /// Number of environments now stopped
    pub async fn retry_failed_stops(&self) -> usize {
        let pending: Vec<String> = self
            .running
            .iter()
            .filter(|r| r.teardown_failed)
            .map(|r| r.key().clone())
            .collect();
        let mut stopped = 0;
        for handle_id in pending {
            if self.stop(&handle_id).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }

    /// Tear down an environment this process did not start (left over from a restart)
    pub async fn stop_detached(&self, env: &ExecutionEnvironment) -> Result<()> {
        if self.running.contains_key(&env.handle_id) {
            return self.stop(&env.handle_id).await;
        }
        self.backend.stop(env).await
    }

    pub fn get(&self, handle_id: &str) -> Option<ExecutionEnvironment> {
        self.running.get(handle_id).map(|r| r.env.clone())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn running_env(&self, handle_id: &str) -> Result<ExecutionEnvironment> {
        match self.running.get(handle_id) {
            Some(running) if !running.teardown_failed => Ok(running.env.clone()),
            _ => Err(OrchestratorError::NotFound(format!(
                "environment '{}' is not running",
                handle_id
            ))),
        }
    }

    /// Run to completion or deadline; non-zero exit is not an error
    pub async fn run(&self, handle_id: &str, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Err(OrchestratorError::validation("argv must not be empty"));
        }
        let env = self.running_env(handle_id)?;
        let command = self.backend.command(&env, argv, Some(timeout), false);
        debug!(handle = handle_id, program = %argv[0], "running command");
        run_with_timeout(command, timeout).await
    }

    /// Long-lived process with piped stdin/stdout, killed when dropped
    ///
    /// The first stdout line is the process id inside the environment, for
    /// use with `kill_process`. Dropping the `Child` only ends the local side.
    pub fn spawn_interactive(&self, handle_id: &str, argv: &[String]) -> Result<Child> {
        if argv.is_empty() {
            return Err(OrchestratorError::validation("argv must not be empty"));
        }
        let env = self.running_env(handle_id)?;
        let mut wrapped = vec![
            "sh".to_string(),
            "-c".to_string(),
            INTERACTIVE_PREAMBLE.to_string(),
            "cpgsession-engine".to_string(),
        ];
        wrapped.extend(argv.iter().cloned());
        let mut command = self.backend.command(&env, &wrapped, None, true);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        command
            .spawn()
            .map_err(|e| OrchestratorError::internal(format!("failed to spawn interactive process: {}", e)))
    }

    /// Kill a process started by `spawn_interactive`; a stopped environment has nothing left to kill
    pub async fn kill_process(&self, handle_id: &str, pid: u32) -> Result<()> {
        let Some(env) = self.get(handle_id) else {
            return Ok(());
        };
        debug!(handle = handle_id, pid, "killing environment process");
        self.backend.kill_process(&env, pid).await
    }
}
