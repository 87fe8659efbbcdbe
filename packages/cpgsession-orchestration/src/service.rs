//! Process-wide facade over registry, scheduler, cache and reaper

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cpgsession_storage::{KeyValueStore, MemoryStore};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acquire::{DefaultSourceAcquirer, SourceAcquirer};
use crate::artifact_cache::ArtifactCache;
use crate::config::{AppConfig, EnvironmentBackendKind, StorageBackend, Validatable};
use crate::engine::{AnalysisEngine, JoernEngine};
use crate::environment::docker::DockerBackend;
use crate::environment::local::LocalProcessBackend;
use crate::environment::{EnvironmentBackend, EnvironmentOrchestrator};
use crate::error::{OrchestratorError, Result};
use crate::job::{JobStatusView, QueryResult};
use crate::reaper::{ExpiryReaper, ReapReport};
use crate::registry::SessionRegistry;
use crate::scheduler::QueryScheduler;
use crate::session::{CreateSessionRequest, Session, SessionStatus, SourceKind};
use crate::templates::QueryTemplate;

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// Swap out any collaborator; the rest come from the config
pub struct ServiceBuilder {
    config: AppConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    backend: Option<Arc<dyn EnvironmentBackend>>,
    engine: Option<Arc<dyn AnalysisEngine>>,
    acquirer: Option<Arc<dyn SourceAcquirer>>,
}

impl ServiceBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            backend: None,
            engine: None,
            acquirer: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn EnvironmentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn AnalysisEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_acquirer(mut self, acquirer: Arc<dyn SourceAcquirer>) -> Self {
        self.acquirer = Some(acquirer);
        self
    }

    fn open_store(config: &AppConfig) -> Result<Arc<dyn KeyValueStore>> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "sqlite")]
            StorageBackend::Sqlite => Ok(Arc::new(cpgsession_storage::SqliteStore::open(
                &config.storage.sqlite_path,
            )?)),
            #[cfg(not(feature = "sqlite"))]
            StorageBackend::Sqlite => Err(OrchestratorError::validation(
                "sqlite storage requested but the sqlite feature is disabled",
            )),
        }
    }

    /// Wire everything up and restore state left by a previous process
    pub async fn build(self) -> Result<AnalysisService> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => Self::open_store(&config)?,
        };
        let backend: Arc<dyn EnvironmentBackend> = match self.backend {
            Some(backend) => backend,
            None => match config.environment.backend {
                EnvironmentBackendKind::Docker => Arc::new(DockerBackend::new(&config.environment)),
                EnvironmentBackendKind::Local => Arc::new(LocalProcessBackend::new()),
            },
        };
        let engine: Arc<dyn AnalysisEngine> = self
            .engine
            .unwrap_or_else(|| Arc::new(JoernEngine::new(config.environment.engine_home.clone())));
        let acquirer: Arc<dyn SourceAcquirer> = self.acquirer.unwrap_or_else(|| {
            Arc::new(DefaultSourceAcquirer::new(
                config.sessions.max_source_size_bytes(),
                CLONE_TIMEOUT,
            ))
        });

        tokio::fs::create_dir_all(config.sessions.sessions_dir()).await?;

        let orchestrator = Arc::new(EnvironmentOrchestrator::new(
            backend,
            config.environment.clone(),
            config.sessions.max_concurrent,
        ));
        let artifacts = Arc::new(ArtifactCache::new(config.artifact.clone(), Arc::clone(&store)));
        let registry = Arc::new(SessionRegistry::new(
            config.sessions.clone(),
            Arc::clone(&store),
            Arc::clone(&orchestrator),
            Arc::clone(&artifacts),
            Arc::clone(&engine),
            acquirer,
        ));
        let scheduler = Arc::new(QueryScheduler::new(
            config.query.clone(),
            Arc::clone(&registry),
            Arc::clone(&orchestrator),
            engine,
        )?);
        let reaper = Arc::new(ExpiryReaper::new(
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&artifacts),
            Arc::clone(&store),
            config.artifact.max_total_size_bytes,
            config.sessions.closed_retention(),
        ));

        let artifacts_loaded = artifacts.load_existing().await?;
        let sessions_loaded = registry.load_persisted().await?;
        info!(
            backend = orchestrator.backend_name(),
            artifacts_loaded,
            sessions_loaded,
            "analysis service ready"
        );

        Ok(AnalysisService {
            config,
            registry,
            scheduler,
            artifacts,
            orchestrator,
            reaper,
            reaper_token: CancellationToken::new(),
            reaper_task: Mutex::new(None),
        })
    }
}

pub struct AnalysisService {
    config: AppConfig,
    registry: Arc<SessionRegistry>,
    scheduler: Arc<QueryScheduler>,
    artifacts: Arc<ArtifactCache>,
    orchestrator: Arc<EnvironmentOrchestrator>,
    reaper: Arc<ExpiryReaper>,
    reaper_token: CancellationToken,
    reaper_task: Mutex<Option<JoinHandle<()>>>,
}

impl AnalysisService {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<QueryScheduler> {
        &self.scheduler
    }

    pub fn artifacts(&self) -> &Arc<ArtifactCache> {
        &self.artifacts
    }

    pub fn orchestrator(&self) -> &Arc<EnvironmentOrchestrator> {
        &self.orchestrator
    }

    // Sessions

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<Session> {
        self.registry.create(request).await
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.registry.get(session_id)
    }

    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        kind: Option<SourceKind>,
    ) -> Vec<Session> {
        self.registry.list(status, kind)
    }

    pub async fn touch_session(&self, session_id: &str) -> Result<Session> {
        self.registry.touch(session_id).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<Session> {
        // Unknown ids must report NotFound before anything is released
        self.registry.get(session_id)?;
        self.scheduler.release_session(session_id).await;
        self.registry.close(session_id, "client").await
    }

    /// Poll until the session leaves CREATING or `timeout` passes
    pub async fn wait_until_settled(&self, session_id: &str, timeout: Duration) -> Result<Session> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let session = self.registry.get(session_id)?;
            if session.status != SessionStatus::Creating {
                return Ok(session);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::NotReady(format!(
                    "session '{}' still provisioning after {}s",
                    session_id,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // Queries

    pub async fn execute_query(
        &self,
        session_id: &str,
        query: &str,
        timeout_seconds: Option<u64>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        self.scheduler
            .execute_sync(session_id, query, timeout_seconds, limit, offset)
            .await
    }

    pub async fn submit_query(
        &self,
        session_id: &str,
        query: &str,
        timeout_seconds: Option<u64>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<String> {
        self.scheduler
            .submit_async(session_id, query, timeout_seconds, limit, offset)
            .await
    }

    /// Render `template` and run it like any other synchronous query
    pub async fn run_template(
        &self,
        session_id: &str,
        template: &QueryTemplate,
        timeout_seconds: Option<u64>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let query = template.render()?;
        debug!(session_id, template = template.name(), query = %query, "running query template");
        self.execute_query(session_id, &query, timeout_seconds, limit, offset)
            .await
    }

    pub fn query_status(&self, job_id: &str) -> Result<JobStatusView> {
        self.scheduler.poll_status(job_id)
    }

    pub fn query_result(&self, job_id: &str) -> Result<QueryResult> {
        self.scheduler.fetch_result(job_id)
    }

    pub fn list_jobs(&self, session_id: Option<&str>) -> Vec<JobStatusView> {
        self.scheduler.list_jobs(session_id)
    }

    // Reaper

    pub fn start_reaper(&self) {
        let mut task = self.reaper_task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(
            Arc::clone(&self.reaper)
                .spawn(self.config.reaper.interval_seconds, self.reaper_token.child_token()),
        );
    }

    pub async fn run_reaper_pass(&self, now: DateTime<Utc>) -> ReapReport {
        self.reaper.run_pass_at(now).await
    }

    /// Stop the reaper and close every live session
    pub async fn shutdown(&self) {
        self.reaper_token.cancel();
        let task = self.reaper_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "reaper task ended abnormally");
            }
        }

        let live: Vec<Session> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|s| s.status.is_live())
            .collect();
        let closes = live.iter().map(|session| async move {
            self.scheduler.release_session(&session.id).await;
            if let Err(e) = self.registry.close(&session.id, "shutdown").await {
                warn!(session_id = %session.id, error = %e, "close during shutdown failed");
            }
        });
        futures::future::join_all(closes).await;
        self.scheduler.shutdown().await;
        info!(closed = live.len(), "analysis service stopped");
    }
}
