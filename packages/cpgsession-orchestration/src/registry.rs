//! Session registry: records, admission, background provisioning
//!
//! The in-memory map is authoritative while the process runs; every
//! transition is written through to `session:<id>` in the key-value store.
//! Admission is an atomic counter of live (CREATING + READY) sessions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cpgsession_storage::{JsonStoreExt, KeyValueStore};
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, error, info, warn, Instrument};

use crate::acquire::SourceAcquirer;
use crate::artifact_cache::{ArtifactCache, ARTIFACT_FILE};
use crate::config::SessionsConfig;
use crate::engine::AnalysisEngine;
use crate::environment::{EnvironmentOrchestrator, ExecutionEnvironment};
use crate::error::{OrchestratorError, Result};
use crate::session::{
    CreateSessionRequest, Session, SessionStatus, SourceDescriptor, SourceKind,
};

const MAX_EXCLUSION_PATTERNS: usize = 64;
const BUILD_DIR: &str = ".build";
const SOURCE_DIR: &str = "source";

pub struct SessionRegistry {
    config: SessionsConfig,
    sessions: DashMap<String, Session>,
    live: AtomicUsize,
    store: Arc<dyn KeyValueStore>,
    orchestrator: Arc<EnvironmentOrchestrator>,
    artifacts: Arc<ArtifactCache>,
    engine: Arc<dyn AnalysisEngine>,
    acquirer: Arc<dyn SourceAcquirer>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionsConfig,
        store: Arc<dyn KeyValueStore>,
        orchestrator: Arc<EnvironmentOrchestrator>,
        artifacts: Arc<ArtifactCache>,
        engine: Arc<dyn AnalysisEngine>,
        acquirer: Arc<dyn SourceAcquirer>,
    ) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            live: AtomicUsize::new(0),
            store,
            orchestrator,
            artifacts,
            engine,
            acquirer,
        }
    }

    fn record_key(id: &str) -> String {
        format!("session:{}", id)
    }

    pub fn workspace_for(&self, id: &str) -> PathBuf {
        self.config.sessions_dir().join(id)
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self
            .store
            .set_json(&Self::record_key(&session.id), session, None)
            .await
        {
            warn!(session_id = %session.id, error = %e, "failed to persist session record");
        }
    }

    fn release_slot(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════════════════

    pub fn validate(&self, request: &CreateSessionRequest) -> Result<(u64, u64)> {
        let source = &request.source;
        let location = source.location.trim();
        if location.is_empty() {
            return Err(OrchestratorError::validation("source location must not be empty"));
        }
        match source.kind {
            SourceKind::Local => {
                if !Path::new(location).is_absolute() {
                    return Err(OrchestratorError::Validation(format!(
                        "local source path must be absolute: {}",
                        location
                    )));
                }
            }
            SourceKind::Remote => {
                let scheme_ok = ["https://", "http://", "ssh://", "git://"]
                    .iter()
                    .any(|scheme| location.starts_with(scheme));
                let scp_like = location.starts_with("git@") && location.contains(':');
                if !scheme_ok && !scp_like {
                    return Err(OrchestratorError::Validation(format!(
                        "remote source must be a git URL: {}",
                        location
                    )));
                }
            }
        }
        if let Some(branch) = &source.branch {
            if branch.trim().is_empty() || branch.starts_with('-') {
                return Err(OrchestratorError::Validation(format!(
                    "invalid branch name '{}'",
                    branch
                )));
            }
        }

        let options = &request.options;
        let ttl = options.ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        if ttl == 0 || ttl > self.config.max_ttl_seconds {
            return Err(OrchestratorError::Validation(format!(
                "ttl_seconds must be between 1 and {}",
                self.config.max_ttl_seconds
            )));
        }
        let idle = options
            .idle_timeout_seconds
            .unwrap_or(self.config.default_idle_timeout_seconds);
        if idle == 0 || idle > self.config.max_ttl_seconds {
            return Err(OrchestratorError::Validation(format!(
                "idle_timeout_seconds must be between 1 and {}",
                self.config.max_ttl_seconds
            )));
        }

        if options.exclusion_patterns.len() > MAX_EXCLUSION_PATTERNS {
            return Err(OrchestratorError::Validation(format!(
                "at most {} exclusion patterns are allowed",
                MAX_EXCLUSION_PATTERNS
            )));
        }
        for pattern in &options.exclusion_patterns {
            Regex::new(pattern).map_err(|e| {
                OrchestratorError::Validation(format!(
                    "exclusion pattern '{}' is not a valid regex: {}",
                    pattern, e
                ))
            })?;
        }
        Ok((ttl, idle))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Create + provisioning
    // ═══════════════════════════════════════════════════════════════════════

    /// Admit and record a CREATING session; provisioning runs in the background
    pub async fn create(self: &Arc<Self>, request: CreateSessionRequest) -> Result<Session> {
        let (ttl, idle) = self.validate(&request)?;

        let max = self.config.max_concurrent;
        if self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "{} live sessions, limit is {}",
                self.live_count(),
                max
            )));
        }

        // The stored record never carries the credential
        let mut record_source = request.source.clone();
        record_source.credential = None;
        let session = Session::new_creating(
            record_source,
            ttl,
            idle,
            request.options.exclusion_patterns.clone(),
            request.options.metadata.clone(),
        );

        if let Err(e) = self
            .store
            .set_json(&Self::record_key(&session.id), &session, None)
            .await
        {
            self.release_slot();
            return Err(e.into());
        }
        self.sessions.insert(session.id.clone(), session.clone());
        info!(
            session_id = %session.id,
            kind = ?session.source.kind,
            language = %session.source.language,
            "session admitted"
        );

        let registry = Arc::clone(self);
        let id = session.id.clone();
        let source = request.source;
        let span = tracing::info_span!("provision", session_id = %id);
        tokio::spawn(
            async move {
                if let Err(e) = registry.provision(&id, source).await {
                    registry.fail(&id, &e).await;
                }
            }
            .instrument(span),
        );

        Ok(session)
    }

    fn is_closed(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map_or(true, |s| s.status == SessionStatus::Closed)
    }

    async fn provision(&self, id: &str, source: SourceDescriptor) -> Result<()> {
        let workspace = self.workspace_for(id);
        tokio::fs::create_dir_all(&workspace).await?;

        let source_dir = self
            .acquirer
            .acquire(&source, &workspace.join(SOURCE_DIR))
            .await?;
        // Only the acquirer ever sees the credential
        let mut source = source;
        source.credential = None;
        debug!(source_dir = %source_dir.display(), "source acquired");

        if self.is_closed(id) {
            info!("session closed during source acquisition");
            return self.abandon(id, None).await;
        }

        let env = self.orchestrator.start(id, &workspace).await?;
        let attached = match self.sessions.get_mut(id) {
            Some(mut session) if session.status == SessionStatus::Creating => {
                session.environment = Some(env.clone());
                Some(session.clone())
            }
            _ => None,
        };
        let Some(snapshot) = attached else {
            info!("session closed during environment start");
            return self.abandon(id, Some(&env)).await;
        };
        self.persist(&snapshot).await;

        let exclusions = snapshot.exclusion_patterns.clone();
        let location = self
            .artifacts
            .resolve_or_build(&source, &exclusions, |_key| {
                self.build_artifact(env.clone(), source_dir.clone(), source.clone(), exclusions.clone())
            })
            .await?;

        if self.is_closed(id) {
            info!("session closed during artifact resolution");
            return self.abandon(id, Some(&env)).await;
        }

        let linked = workspace.join(ARTIFACT_FILE);
        link_or_copy(&location.path, &linked).await?;

        let ready = match self.sessions.get_mut(id) {
            Some(mut session) if session.status == SessionStatus::Creating => {
                session.mark_ready(location.key.clone())?;
                Some(session.clone())
            }
            _ => None,
        };
        match ready {
            Some(session) => {
                self.persist(&session).await;
                info!(key = %location.key, built = location.built, "session ready");
                Ok(())
            }
            None => {
                info!("session closed while linking artifact");
                self.abandon(id, Some(&env)).await
            }
        }
    }

    /// Undo a provisioning run whose session was closed underneath it
    async fn abandon(&self, id: &str, env: Option<&ExecutionEnvironment>) -> Result<()> {
        let stopped = match env {
            Some(env) => self.orchestrator.stop(&env.handle_id).await,
            None => Ok(()),
        };
        remove_workspace(&self.workspace_for(id)).await;
        stopped
    }

    async fn build_artifact(
        &self,
        env: ExecutionEnvironment,
        source_dir: PathBuf,
        source: SourceDescriptor,
        exclusions: Vec<String>,
    ) -> Result<PathBuf> {
        let build_dir = env.host_workspace.join(BUILD_DIR);
        tokio::fs::create_dir_all(&build_dir).await?;
        let output = build_dir.join(ARTIFACT_FILE);

        let argv = self.engine.frontend_command(
            source.language,
            &env.guest_path(&source_dir),
            &env.guest_path(&output),
            &exclusions,
        );
        let timeout = self.artifacts.build_timeout();
        let out = self.orchestrator.run(&env.handle_id, &argv, timeout).await?;
        if out.timed_out {
            return Err(OrchestratorError::BuildTimeout(
                format!("artifact generation exceeded {}s", timeout.as_secs()),
            ));
        }
        if !out.success() {
            return Err(OrchestratorError::Build(format!(
                "{} frontend exited with {}: {}",
                self.engine.name(),
                out.exit_code,
                out.error_summary()
            )));
        }
        Ok(output)
    }

    /// Record a provisioning failure: ERROR, environment stopped, no retry
    async fn fail(&self, id: &str, err: &OrchestratorError) {
        let (env, snapshot) = match self.sessions.get_mut(id) {
            Some(mut session) if session.status == SessionStatus::Creating => {
                let env = session.environment.take();
                if session.mark_error(err.message()).is_err() {
                    return;
                }
                (env, session.clone())
            }
            _ => {
                debug!(session_id = id, error = %err, "provisioning error after close ignored");
                return;
            }
        };
        self.release_slot();
        error!(session_id = id, kind = %err.kind(), error = %err, "session provisioning failed");

        if let Some(env) = env {
            if let Err(e) = self.orchestrator.stop(&env.handle_id).await {
                warn!(session_id = id, error = %e, "failed to stop environment after error");
            }
        }
        self.persist(&snapshot).await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads + lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get(&self, id: &str) -> Result<Session> {
        self.sessions
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| OrchestratorError::not_found("session", id))
    }

    pub fn list(&self, status: Option<SessionStatus>, kind: Option<SourceKind>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .filter(|s| kind.map_or(true, |k| s.source.kind == k))
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    pub async fn touch(&self, id: &str) -> Result<Session> {
        self.touch_at(id, Utc::now()).await
    }

    pub async fn touch_at(&self, id: &str, now: DateTime<Utc>) -> Result<Session> {
        let snapshot = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found("session", id))?;
            if session.status == SessionStatus::Closed {
                return Err(OrchestratorError::NotFound(format!("session '{}' is closed", id)));
            }
            session.touch_at(now);
            session.clone()
        };
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Idempotent; the artifact cache entry is left alone
    pub async fn close(&self, id: &str, reason: &str) -> Result<Session> {
        let (env, was_live, snapshot) = {
            let mut session = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::not_found("session", id))?;
            if session.status == SessionStatus::Closed {
                return Ok(session.clone());
            }
            let was_live = session.status.is_live();
            let env = session.environment.take();
            session.mark_closed();
            (env, was_live, session.clone())
        };
        if was_live {
            self.release_slot();
        }
        info!(session_id = id, reason, "session closed");
        self.persist(&snapshot).await;

        if let Some(env) = env {
            if let Err(e) = self.orchestrator.stop(&env.handle_id).await {
                warn!(session_id = id, error = %e, "environment stop failed during close");
            }
        }
        remove_workspace(&self.workspace_for(id)).await;
        Ok(snapshot)
    }

    /// Retry environment teardowns that failed earlier
    ///
    /// # Returns
    ///
    /// Environments whose capacity was reclaimed
    pub async fn reclaim_environments(&self) -> usize {
        self.orchestrator.retry_failed_stops().await
    }

    /// Drop CLOSED / ERROR records settled before `now - retention`
    pub async fn purge_closed(&self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.settled_at().map_or(false, |at| now - at > retention))
            .map(|s| s.id.clone())
            .collect();

        let mut purged = 0;
        for id in expired {
            if self
                .sessions
                .remove_if(&id, |_, s| !s.status.is_live())
                .is_none()
            {
                continue;
            }
            if let Err(e) = self.store.delete(&Self::record_key(&id)).await {
                warn!(session_id = %id, error = %e, "failed to delete session record");
            }
            remove_workspace(&self.workspace_for(&id)).await;
            purged += 1;
        }
        purged
    }

    /// Reload persisted records after a restart
    ///
    /// Sessions that were live when the previous process died cannot be
    /// resumed; they become ERROR and their environments are torn down.
    pub async fn load_persisted(&self) -> Result<usize> {
        let keys = self.store.keys("session:").await?;
        let mut loaded = 0;
        for key in keys {
            let Some(mut session) = self.store.get_json::<Session>(&key).await? else {
                continue;
            };
            if session.status.is_live() {
                if let Some(env) = session.environment.take() {
                    if let Err(e) = self.orchestrator.stop_detached(&env).await {
                        warn!(session_id = %session.id, error = %e, "orphaned environment cleanup failed");
                    }
                }
                session.status = SessionStatus::Error;
                session.error_message = Some("interrupted by service restart".to_string());
                self.persist(&session).await;
            }
            self.sessions.insert(session.id.clone(), session);
            loaded += 1;
        }
        if loaded > 0 {
            info!(loaded, "session records restored");
        }
        Ok(loaded)
    }
}

async fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    let _ = tokio::fs::remove_file(to).await;
    if tokio::fs::hard_link(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
    }
    Ok(())
}

async fn remove_workspace(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove workspace"),
    }
}
