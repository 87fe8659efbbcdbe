//! Shared harness: a real service over the local backend, an in-memory
//! store and a `sh`-driven stand-in for the analysis engine.
//!
//! Queries handed to the stub engine are shell snippets; `$OUT` names the
//! file the snippet must write its JSON to and `$OFFSET` holds the row offset.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpgsession_orchestration::acquire::{AcquireError, DefaultSourceAcquirer, SourceAcquirer};
use cpgsession_orchestration::config::{AppConfig, EnvironmentBackendKind, StorageBackend};
use cpgsession_orchestration::engine::shell_quote;
use cpgsession_orchestration::environment::local::LocalProcessBackend;
use cpgsession_orchestration::{
    AnalysisEngine, AnalysisService, EnvironmentBackend, ExecutionEnvironment, CreateSessionRequest, Language, Session, SessionOptions,
    SessionStatus, ServiceBuilder, SourceDescriptor, SourceKind,
};
use cpgsession_storage::{KeyValueStore, MemoryStore};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repl {
    Healthy,
    /// Exits right away, so every warm attempt sees a crash
    Crashing,
}

#[derive(Debug, Clone)]
pub struct StubEngine {
    pub build_log: PathBuf,
    pub build_delay: Duration,
    pub fail_build: bool,
    pub artifact_bytes: usize,
    pub repl: Repl,
}

impl AnalysisEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn frontend_command(
        &self,
        _language: Language,
        source_dir: &Path,
        output: &Path,
        exclusion_patterns: &[String],
    ) -> Vec<String> {
        let script = if self.fail_build {
            "echo 'frontend exploded' >&2; exit 2".to_string()
        } else {
            format!(
                "sleep {:.3}; test -d {src} || exit 3; echo {excl} >> {log}; head -c {n} /dev/zero > {out}",
                self.build_delay.as_secs_f64(),
                src = shell_quote(&source_dir.to_string_lossy()),
                excl = shell_quote(&exclusion_patterns.join(",")),
                log = shell_quote(&self.build_log.to_string_lossy()),
                n = self.artifact_bytes,
                out = shell_quote(&output.to_string_lossy()),
            )
        };
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    fn render_script(&self, query: &str, _limit: usize, offset: usize, output: &Path) -> String {
        format!(
            "OUT={}\nOFFSET={}\n{}\n",
            shell_quote(&output.to_string_lossy()),
            offset,
            query
        )
    }

    fn direct_query_command(&self, _artifact: &Path, script: &Path) -> Vec<String> {
        vec!["sh".to_string(), script.to_string_lossy().into_owned()]
    }

    fn repl_command(&self, _artifact: &Path) -> Vec<String> {
        match self.repl {
            Repl::Healthy => vec!["sh".to_string(), "-s".to_string()],
            Repl::Crashing => vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
        }
    }

    fn repl_invocation(&self, script: &Path, marker: &str) -> String {
        format!(". {}; echo {}\n", shell_quote(&script.to_string_lossy()), marker)
    }
}

/// LOCAL sources are copied for real; REMOTE sources never touch the network
pub struct StubAcquirer {
    local: DefaultSourceAcquirer,
}

#[async_trait]
impl SourceAcquirer for StubAcquirer {
    async fn acquire(&self, source: &SourceDescriptor, dest: &Path) -> Result<PathBuf, AcquireError> {
        match source.kind {
            SourceKind::Local => self.local.acquire(source, dest).await,
            SourceKind::Remote if source.location.contains("private") && source.credential.is_none() => {
                Err(AcquireError::AuthRequired(source.location.clone()))
            }
            SourceKind::Remote => {
                tokio::fs::create_dir_all(dest).await?;
                tokio::fs::write(dest.join("README"), source.location.as_bytes()).await?;
                Ok(dest.to_path_buf())
            }
        }
    }
}

/// Local backend whose first `failures` teardowns report an error
pub struct FlakyTeardownBackend {
    local: LocalProcessBackend,
    failures: AtomicUsize,
}

#[async_trait]
impl EnvironmentBackend for FlakyTeardownBackend {
    fn name(&self) -> &'static str {
        "flaky-local"
    }

    fn handle_for(&self, session_id: &str) -> String {
        self.local.handle_for(session_id)
    }

    fn guest_workspace(&self, host_workspace: &Path) -> PathBuf {
        self.local.guest_workspace(host_workspace)
    }

    fn guest_auxiliary(&self, host_auxiliary: &Path) -> PathBuf {
        self.local.guest_auxiliary(host_auxiliary)
    }

    async fn start(
        &self,
        env: &ExecutionEnvironment,
        deadline: Duration,
    ) -> cpgsession_orchestration::Result<()> {
        self.local.start(env, deadline).await
    }

    async fn stop(&self, env: &ExecutionEnvironment) -> cpgsession_orchestration::Result<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(cpgsession_orchestration::OrchestratorError::internal(
                "container runtime not responding",
            ));
        }
        self.local.stop(env).await
    }

    async fn kill_process(
        &self,
        env: &ExecutionEnvironment,
        pid: u32,
    ) -> cpgsession_orchestration::Result<()> {
        self.local.kill_process(env, pid).await
    }

    fn command(
        &self,
        env: &ExecutionEnvironment,
        argv: &[String],
        timeout: Option<Duration>,
        interactive: bool,
    ) -> tokio::process::Command {
        self.local.command(env, argv, timeout, interactive)
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub max_sessions: usize,
    pub persistent: bool,
    pub repl: Repl,
    pub build_delay: Duration,
    pub fail_build: bool,
    pub artifact_bytes: usize,
    pub build_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub closed_retention_seconds: u64,
    pub failing_teardowns: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            persistent: true,
            repl: Repl::Healthy,
            build_delay: Duration::from_millis(50),
            fail_build: false,
            artifact_bytes: 2048,
            build_timeout_seconds: 30,
            idle_timeout_seconds: 1800,
            closed_retention_seconds: 3600,
            failing_teardowns: 0,
        }
    }
}

pub struct Harness {
    pub service: AnalysisService,
    pub store: Arc<dyn KeyValueStore>,
    pub root: TempDir,
    pub build_log: PathBuf,
}

pub fn config_for(root: &Path, opts: &Options) -> AppConfig {
    let mut config = AppConfig::default();
    config.sessions.workspace_root = root.join("workspaces");
    config.sessions.max_concurrent = opts.max_sessions;
    config.sessions.default_idle_timeout_seconds = opts.idle_timeout_seconds;
    config.sessions.closed_retention_seconds = opts.closed_retention_seconds;
    config.environment.backend = EnvironmentBackendKind::Local;
    config.environment.start_timeout_seconds = 5;
    config.artifact.cache_dir = root.join("artifacts");
    config.artifact.build_timeout_seconds = opts.build_timeout_seconds;
    config.query.persistent_enabled = opts.persistent;
    config.storage.backend = StorageBackend::Memory;
    config
}

pub async fn build_service(
    root: &Path,
    opts: &Options,
    store: Arc<dyn KeyValueStore>,
) -> AnalysisService {
    let build_log = root.join("builds.log");
    let engine = StubEngine {
        build_log,
        build_delay: opts.build_delay,
        fail_build: opts.fail_build,
        artifact_bytes: opts.artifact_bytes,
        repl: opts.repl,
    };
    ServiceBuilder::new(config_for(root, opts))
        .with_store(store)
        .with_backend(Arc::new(FlakyTeardownBackend {
            local: LocalProcessBackend::new(),
            failures: AtomicUsize::new(opts.failing_teardowns),
        }))
        .with_engine(Arc::new(engine))
        .with_acquirer(Arc::new(StubAcquirer {
            local: DefaultSourceAcquirer::new(64 * 1024 * 1024, Duration::from_secs(10)),
        }))
        .build()
        .await
        .expect("service builds")
}

pub async fn harness(opts: Options) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let service = build_service(root.path(), &opts, Arc::clone(&store)).await;
    let build_log = root.path().join("builds.log");
    Harness {
        service,
        store,
        root,
        build_log,
    }
}

impl Harness {
    /// A source tree with one marker file
    pub fn source_dir(&self, name: &str) -> PathBuf {
        let dir = self.root.path().join("sources").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.py", name)), "print('hi')\n").unwrap();
        dir
    }

    pub fn local_request(&self, name: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            source: SourceDescriptor::local(self.source_dir(name).to_string_lossy(), Language::Python),
            options: SessionOptions::default(),
        }
    }

    pub async fn ready_session(&self, name: &str) -> Session {
        let created = self.service.create_session(self.local_request(name)).await.unwrap();
        let session = self.settle(&created.id).await;
        assert_eq!(session.status, SessionStatus::Ready, "{:?}", session.error_message);
        session
    }

    pub async fn settle(&self, session_id: &str) -> Session {
        self.service
            .wait_until_settled(session_id, Duration::from_secs(15))
            .await
            .unwrap()
    }

    pub fn build_count(&self) -> usize {
        std::fs::read_to_string(&self.build_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }
}

/// Shell snippet writing `json` to the output file
pub fn emit(json: &str) -> String {
    format!("printf '%s' {} > \"$OUT\"", shell_quote(json))
}
