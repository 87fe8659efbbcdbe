//! Periodic expiry and garbage collection

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cpgsession_storage::KeyValueStore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact_cache::ArtifactCache;
use crate::registry::SessionRegistry;
use crate::scheduler::QueryScheduler;

const FALLBACK_INTERVAL_SECONDS: u64 = 60;

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// (session id, reason)
    pub closed: Vec<(String, String)>,
    pub close_failures: usize,
    /// Environments whose failed teardown succeeded on retry
    pub environments_reclaimed: usize,
    pub artifacts_evicted: usize,
    pub freed_bytes: u64,
    pub cached_results: u64,
    pub jobs_purged: usize,
    pub sessions_purged: usize,
    pub store_keys_purged: usize,
}

impl ReapReport {
    pub fn is_quiet(&self) -> bool {
        self.closed.is_empty()
            && self.close_failures == 0
            && self.environments_reclaimed == 0
            && self.artifacts_evicted == 0
            && self.jobs_purged == 0
            && self.sessions_purged == 0
            && self.store_keys_purged == 0
    }
}

pub struct ExpiryReaper {
    registry: Arc<SessionRegistry>,
    scheduler: Arc<QueryScheduler>,
    artifacts: Arc<ArtifactCache>,
    store: Arc<dyn KeyValueStore>,
    max_artifact_bytes: u64,
    closed_retention: chrono::Duration,
}

impl ExpiryReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        scheduler: Arc<QueryScheduler>,
        artifacts: Arc<ArtifactCache>,
        store: Arc<dyn KeyValueStore>,
        max_artifact_bytes: u64,
        closed_retention: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            scheduler,
            artifacts,
            store,
            max_artifact_bytes,
            closed_retention,
        }
    }

    /// One full pass evaluated at `now`
    ///
    /// Failures on individual sessions are logged and counted; the pass
    /// always runs to the end.
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> ReapReport {
        let mut report = ReapReport::default();

        for session in self.registry.snapshot() {
            let Some(reason) = session.expiry_reason_at(now) else {
                continue;
            };
            self.scheduler.release_session(&session.id).await;
            match self.registry.close(&session.id, reason).await {
                Ok(_) => report.closed.push((session.id.clone(), reason.to_string())),
                Err(e) => {
                    report.close_failures += 1;
                    warn!(session_id = %session.id, error = %e, "expiry close failed");
                }
            }
        }

        report.environments_reclaimed = self.registry.reclaim_environments().await;

        let eviction = self.artifacts.evict(self.max_artifact_bytes).await;
        report.artifacts_evicted = eviction.evicted.len();
        report.freed_bytes = eviction.freed_bytes;

        report.cached_results = self.scheduler.purge_results().await;
        report.jobs_purged = self.scheduler.purge_jobs(now);
        report.sessions_purged = self
            .registry
            .purge_closed(now, self.closed_retention)
            .await;

        match self.store.purge_expired().await {
            Ok(n) => report.store_keys_purged = n,
            Err(e) => warn!(error = %e, "store purge failed"),
        }

        if report.is_quiet() {
            debug!("reaper pass found nothing to do");
        } else {
            info!(
                closed = report.closed.len(),
                failures = report.close_failures,
                reclaimed = report.environments_reclaimed,
                evicted = report.artifacts_evicted,
                freed_bytes = report.freed_bytes,
                jobs_purged = report.jobs_purged,
                sessions_purged = report.sessions_purged,
                "reaper pass complete"
            );
        }
        report
    }

    /// Run passes every `interval_seconds` until `token` is cancelled
    pub fn spawn(self: Arc<Self>, interval_seconds: u64, token: CancellationToken) -> JoinHandle<()> {
        let seconds = if interval_seconds == 0 {
            warn!(
                fallback = FALLBACK_INTERVAL_SECONDS,
                "reaper interval of 0 is not usable, using fallback"
            );
            FALLBACK_INTERVAL_SECONDS
        } else {
            interval_seconds
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_pass_at(Utc::now()).await;
                    }
                }
            }
            debug!("reaper stopped");
        })
    }
}
