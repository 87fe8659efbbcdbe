//! Query execution against READY sessions
//!
//! Two entry points share one execution path:
//!
//! - `execute_sync`: blocks the caller until the query finishes or times out
//! - `submit_async`: records a PENDING job and returns its id; the job runs on
//!   the session's FIFO lane, bounded globally by `max_concurrent_jobs`
//!
//! Queries on the same session never overlap: each run holds the session's
//! execution lock (FIFO) from script write to output read. Successful results
//! are cached per (session, query, limit) for `cache_ttl_seconds`.

pub mod warm;

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::artifact_cache::ARTIFACT_FILE;
use crate::config::QueryConfig;
use crate::engine::AnalysisEngine;
use crate::environment::{EnvironmentOrchestrator, ExecutionEnvironment};
use crate::error::{OrchestratorError, Result};
use crate::job::{JobStatusView, QueryJob, QueryResult};
use crate::keyed_lock::KeyedLock;
use crate::query::{parse_output, QueryPolicy, Row};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionStatus};

pub use warm::EngineMode;
use warm::{WarmOutcome, WarmProcess, WarmSlot};

const QUERY_DIR: &str = ".queries";
const ENGINE_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CachedResult {
    session_id: String,
    result: QueryResult,
}

fn result_key(session_id: &str, query: &str, limit: usize, offset: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(query.as_bytes());
    hasher.update([0u8]);
    hasher.update(limit.to_le_bytes());
    hasher.update(offset.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn remaining(deadline: Instant) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(OrchestratorError::QueryTimeout(
            "deadline reached before the engine ran".to_string(),
        ));
    }
    Ok(left)
}

pub struct QueryScheduler {
    config: QueryConfig,
    policy: QueryPolicy,
    registry: Arc<SessionRegistry>,
    orchestrator: Arc<EnvironmentOrchestrator>,
    engine: Arc<dyn AnalysisEngine>,
    session_locks: KeyedLock,
    results: Cache<String, CachedResult>,
    engines: DashMap<String, Arc<Mutex<WarmSlot>>>,
    jobs: DashMap<String, QueryJob>,
    lanes: DashMap<String, mpsc::UnboundedSender<String>>,
    job_permits: Semaphore,
}

impl QueryScheduler {
    pub fn new(
        config: QueryConfig,
        registry: Arc<SessionRegistry>,
        orchestrator: Arc<EnvironmentOrchestrator>,
        engine: Arc<dyn AnalysisEngine>,
    ) -> Result<Self> {
        let policy = QueryPolicy::new(&config)?;
        let results = Cache::builder()
            .max_capacity(config.cache_max_entries)
            .time_to_live(Duration::from_secs(config.cache_ttl_seconds))
            .support_invalidation_closures()
            .build();
        let job_permits = Semaphore::new(config.max_concurrent_jobs.max(1));
        Ok(Self {
            config,
            policy,
            registry,
            orchestrator,
            engine,
            session_locks: KeyedLock::new(),
            results,
            engines: DashMap::new(),
            jobs: DashMap::new(),
            lanes: DashMap::new(),
            job_permits,
        })
    }

    fn resolve(&self, timeout_seconds: Option<u64>, limit: Option<usize>) -> (u64, usize) {
        (
            timeout_seconds.unwrap_or(self.config.default_timeout_seconds),
            limit.unwrap_or(self.config.default_limit),
        )
    }

    fn ready_session(&self, session_id: &str) -> Result<Session> {
        let session = self.registry.get(session_id)?;
        if session.status != SessionStatus::Ready {
            return Err(OrchestratorError::NotFound(format!(
                "session '{}' is not ready ({})",
                session_id, session.status
            )));
        }
        Ok(session)
    }

    async fn touch(&self, session_id: &str) {
        if let Err(e) = self.registry.touch(session_id).await {
            debug!(session_id, error = %e, "touch after query skipped");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Synchronous execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Run a query and wait for its result
    ///
    /// Errors are reserved for requests that never reach the engine
    /// (validation, unknown or non-READY session). Engine failures and
    /// timeouts come back as `QueryResult::Failure`.
    pub async fn execute_sync(
        &self,
        session_id: &str,
        query: &str,
        timeout_seconds: Option<u64>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<QueryResult> {
        let (timeout_seconds, limit) = self.resolve(timeout_seconds, limit);
        let offset = offset.unwrap_or(0);
        self.policy.validate(query, timeout_seconds, limit, offset)?;
        self.ready_session(session_id)?;
        self.execute(session_id, query, timeout_seconds, limit, offset)
            .await
    }

    async fn execute(
        &self,
        session_id: &str,
        query: &str,
        timeout_seconds: u64,
        limit: usize,
        offset: usize,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let key = result_key(session_id, query, limit, offset);
        if let Some(hit) = self.results.get(&key).await {
            debug!(session_id, "query result cache hit");
            self.touch(session_id).await;
            return Ok(hit.result);
        }

        let timeout = Duration::from_secs(timeout_seconds);
        let deadline = started + timeout;
        let Some(_guard) = self.session_locks.lock_timeout(session_id, timeout).await else {
            warn!(session_id, timeout_s = timeout_seconds, "session busy past query deadline");
            let err = OrchestratorError::QueryTimeout(format!(
                "session was busy for the whole {}s budget",
                timeout_seconds
            ));
            return Ok(QueryResult::failure(&err, started.elapsed().as_secs_f64()));
        };

        // Closed while we were queued, or a queued twin already ran this query
        let session = self.ready_session(session_id)?;
        if let Some(hit) = self.results.get(&key).await {
            self.touch(session_id).await;
            return Ok(hit.result);
        }

        let result = match self
            .run_locked(&session, query, limit, offset, deadline)
            .await
        {
            Ok(rows) => QueryResult::success(rows, 0.0),
            Err(e) => {
                warn!(session_id, kind = %e.kind(), error = %e, "query failed");
                QueryResult::failure(&e, 0.0)
            }
        }
        .with_execution_time(started.elapsed().as_secs_f64());

        if result.is_success() {
            self.results
                .insert(
                    key,
                    CachedResult {
                        session_id: session_id.to_string(),
                        result: result.clone(),
                    },
                )
                .await;
            self.touch(session_id).await;
        }
        Ok(result)
    }

    async fn run_locked(
        &self,
        session: &Session,
        query: &str,
        limit: usize,
        offset: usize,
        deadline: Instant,
    ) -> Result<Vec<Row>> {
        let env = session.environment.as_ref().ok_or_else(|| {
            OrchestratorError::NotReady(format!("session '{}' has no environment", session.id))
        })?;
        let workspace = &env.host_workspace;
        let query_dir = workspace.join(QUERY_DIR);
        tokio::fs::create_dir_all(&query_dir).await?;

        let run_id = Uuid::new_v4().simple().to_string();
        let script = query_dir.join(format!("{}.sc", run_id));
        let output = query_dir.join(format!("{}.json", run_id));
        let artifact = env.guest_path(&workspace.join(ARTIFACT_FILE));

        let text = self
            .engine
            .render_script(query, limit, offset, &env.guest_path(&output));
        tokio::fs::write(&script, text).await?;

        let rows = match self
            .dispatch(&session.id, env, &artifact, &env.guest_path(&script), deadline)
            .await
        {
            Ok(()) => read_output(&output, limit).await,
            Err(e) => Err(e),
        };

        let _ = tokio::fs::remove_file(&script).await;
        let _ = tokio::fs::remove_file(&output).await;
        rows
    }

    /// Persistent engine first, direct process on crash or when disabled
    async fn dispatch(
        &self,
        session_id: &str,
        env: &ExecutionEnvironment,
        artifact: &Path,
        script: &Path,
        deadline: Instant,
    ) -> Result<()> {
        if self.config.persistent_enabled {
            let slot = self
                .engines
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(WarmSlot::new(true))))
                .clone();
            let mut slot = slot.lock().await;

            if slot.mode.allows_warm() {
                let budget = remaining(deadline)?;
                let outcome = match self.ensure_warm(&mut slot, env, artifact).await {
                    Err(e) => WarmOutcome::Crashed(format!("engine failed to start: {}", e)),
                    Ok(process) => {
                        let marker = format!("__CPGSESSION_DONE_{}__", Uuid::new_v4().simple());
                        let invocation = self.engine.repl_invocation(script, &marker);
                        process.run(&invocation, &marker, budget).await
                    }
                };

                match outcome {
                    WarmOutcome::Completed => {
                        slot.mode = slot.mode.after_success();
                        return Ok(());
                    }
                    WarmOutcome::TimedOut => {
                        slot.kill(&self.orchestrator).await;
                        slot.mode = slot.mode.after_timeout();
                        warn!(session_id, mode = ?slot.mode, "persistent engine timed out, process killed");
                        return Err(OrchestratorError::QueryTimeout(format!(
                            "query exceeded {}s",
                            budget.as_secs().max(1)
                        )));
                    }
                    WarmOutcome::Crashed(reason) => {
                        slot.kill(&self.orchestrator).await;
                        slot.mode = slot.mode.after_crash();
                        warn!(
                            session_id,
                            reason = %reason,
                            mode = ?slot.mode,
                            "persistent engine crashed, retrying in direct mode"
                        );
                    }
                }
            }
        }
        self.run_direct(env, artifact, script, deadline).await
    }

    async fn ensure_warm<'a>(
        &self,
        slot: &'a mut WarmSlot,
        env: &ExecutionEnvironment,
        artifact: &Path,
    ) -> Result<&'a mut WarmProcess> {
        if slot.process.is_none() {
            let argv = self.engine.repl_command(artifact);
            let child = self.orchestrator.spawn_interactive(&env.handle_id, &argv)?;
            let process = WarmProcess::start(child, &env.handle_id, ENGINE_START_TIMEOUT).await?;
            slot.process = Some(process);
            debug!(session_id = %env.session_id, "persistent engine started");
        }
        slot.process
            .as_mut()
            .ok_or_else(|| OrchestratorError::internal("persistent engine slot is empty"))
    }

    async fn run_direct(
        &self,
        env: &ExecutionEnvironment,
        artifact: &Path,
        script: &Path,
        deadline: Instant,
    ) -> Result<()> {
        let budget = remaining(deadline)?;
        let argv = self.engine.direct_query_command(artifact, script);
        let out = self.orchestrator.run(&env.handle_id, &argv, budget).await?;
        if out.timed_out {
            return Err(OrchestratorError::QueryTimeout(format!(
                "query exceeded {}s",
                budget.as_secs().max(1)
            )));
        }
        if !out.success() {
            return Err(OrchestratorError::QueryExecution(format!(
                "{} exited with {}: {}",
                self.engine.name(),
                out.exit_code,
                out.error_summary()
            )));
        }
        Ok(())
    }

    /// Current mode for a session; sessions that never ran a query are `WarmOk`
    pub async fn engine_mode(&self, session_id: &str) -> EngineMode {
        if !self.config.persistent_enabled {
            return EngineMode::ColdFallback;
        }
        let slot = self.engines.get(session_id).map(|s| Arc::clone(s.value()));
        match slot {
            Some(slot) => slot.lock().await.mode,
            None => EngineMode::WarmOk,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Async jobs
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn submit_async(
        self: &Arc<Self>,
        session_id: &str,
        query: &str,
        timeout_seconds: Option<u64>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<String> {
        let (timeout_seconds, limit) = self.resolve(timeout_seconds, limit);
        let offset = offset.unwrap_or(0);
        self.policy.validate(query, timeout_seconds, limit, offset)?;
        self.ready_session(session_id)?;

        let job = QueryJob::new_pending_page(session_id, query, timeout_seconds, limit, offset);
        let job_id = job.id.clone();
        self.jobs.insert(job_id.clone(), job);
        self.enqueue(session_id, job_id.clone());
        info!(session_id, job_id = %job_id, "query job submitted");
        Ok(job_id)
    }

    fn enqueue(self: &Arc<Self>, session_id: &str, job_id: String) {
        let mut pending = job_id;
        for _ in 0..2 {
            let sender = self
                .lanes
                .entry(session_id.to_string())
                .or_insert_with(|| self.spawn_lane(session_id))
                .clone();
            match sender.send(pending) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.lanes.remove(session_id);
                    pending = returned;
                }
            }
        }
        if let Some(mut job) = self.jobs.get_mut(&pending) {
            let _ = job.cancel("query lane unavailable");
        }
    }

    fn spawn_lane(self: &Arc<Self>, session_id: &str) -> mpsc::UnboundedSender<String> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let span = tracing::info_span!("query_lane", session_id = %session_id);
        tokio::spawn(
            async move {
                while let Some(job_id) = rx.recv().await {
                    let Some(scheduler) = scheduler.upgrade() else {
                        break;
                    };
                    scheduler.run_job(&job_id).await;
                }
                debug!("query lane closed");
            }
            .instrument(span),
        );
        tx
    }

    async fn run_job(&self, job_id: &str) {
        let Ok(_permit) = self.job_permits.acquire().await else {
            return;
        };
        let (session_id, query, timeout_seconds, limit, offset) = {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return;
            };
            // Cancelled while queued
            if job.start().is_err() {
                return;
            }
            (
                job.session_id.clone(),
                job.query.clone(),
                job.timeout_seconds,
                job.result_limit,
                job.result_offset,
            )
        };

        let started = Instant::now();
        let result = match self
            .execute(&session_id, &query, timeout_seconds, limit, offset)
            .await
        {
            Ok(result) => result,
            Err(e) => QueryResult::failure(&e, started.elapsed().as_secs_f64()),
        };

        if let Some(mut job) = self.jobs.get_mut(job_id) {
            match job.finish(result) {
                Ok(()) => info!(job_id, status = %job.status, "query job finished"),
                Err(_) => debug!(job_id, "job was cancelled while running, result dropped"),
            }
        }
    }

    pub fn poll_status(&self, job_id: &str) -> Result<JobStatusView> {
        self.jobs
            .get(job_id)
            .map(|job| JobStatusView::from(job.value()))
            .ok_or_else(|| OrchestratorError::not_found("job", job_id))
    }

    pub fn fetch_result(&self, job_id: &str) -> Result<QueryResult> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| OrchestratorError::not_found("job", job_id))?
            .outcome()
    }

    pub fn list_jobs(&self, session_id: Option<&str>) -> Vec<JobStatusView> {
        let mut views: Vec<JobStatusView> = self
            .jobs
            .iter()
            .filter(|job| session_id.map_or(true, |sid| job.session_id == sid))
            .map(|job| JobStatusView::from(job.value()))
            .collect();
        views.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        views
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cleanup
    // ═══════════════════════════════════════════════════════════════════════

    /// Forget everything tied to a closing session
    ///
    /// # Returns
    ///
    /// Number of jobs cancelled
    pub async fn release_session(&self, session_id: &str) -> usize {
        self.lanes.remove(session_id);

        let mut cancelled = 0;
        for mut job in self.jobs.iter_mut() {
            if job.session_id == session_id && job.cancel("session closed").is_ok() {
                cancelled += 1;
            }
        }

        if let Some((_, slot)) = self.engines.remove(session_id) {
            // A query still holding the slot drops the process when it finishes
            if let Ok(mut slot) = slot.try_lock() {
                slot.kill(&self.orchestrator).await;
            }
        }

        let sid = session_id.to_string();
        if let Err(e) = self
            .results
            .invalidate_entries_if(move |_, cached| cached.session_id == sid)
        {
            warn!(session_id, error = %e, "failed to invalidate cached results");
        }
        self.session_locks.prune();

        if cancelled > 0 {
            info!(session_id, cancelled, "pending query jobs cancelled");
        }
        cancelled
    }

    /// Drop terminal jobs finished more than `job_retention_seconds` ago
    pub fn purge_jobs(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.job_retention();
        let mut purged = 0;
        self.jobs.retain(|_, job| {
            let expired = job.is_expired_at(now, retention);
            if expired {
                purged += 1;
            }
            !expired
        });
        purged
    }

    /// Apply pending cache expirations
    ///
    /// # Returns
    ///
    /// Entries still cached
    pub async fn purge_results(&self) -> u64 {
        self.results.run_pending_tasks().await;
        self.results.entry_count()
    }

    pub async fn shutdown(&self) {
        self.lanes.clear();
        let sessions: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            if let Some((_, slot)) = self.engines.remove(&session_id) {
                slot.lock().await.kill(&self.orchestrator).await;
            }
        }
    }
}

async fn read_output(path: &Path, limit: usize) -> Result<Vec<Row>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(parse_output(&raw, limit)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OrchestratorError::QueryExecution(
            "engine produced no output file".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}
