/*
 * cpgsession Orchestration - Code Analysis Session Service
 *
 * Sandboxed, cached code-property-graph sessions over a pluggable engine.
 *
 * Architecture:
 * - Session Registry (admission, provisioning, persistence)
 * - Environment Orchestrator (Docker / local sandboxes)
 * - Artifact Cache (build-once, durable lease, LRU eviction)
 * - Query Scheduler (per-session FIFO, persistent engine, async jobs)
 * - Query Templates (canned browsing and taint CPGQL)
 * - Expiry Reaper (idle/TTL close, GC)
 */

pub mod acquire;
pub mod artifact_cache;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod job;
pub mod keyed_lock;
pub mod operations;
pub mod query;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod templates;

// Re-exports
pub use acquire::{AcquireError, DefaultSourceAcquirer, SourceAcquirer};
pub use artifact_cache::{artifact_key, ArtifactCache, ArtifactCacheEntry, ArtifactLocation, EvictionReport};
pub use config::{AppConfig, ConfigError};
pub use engine::{AnalysisEngine, JoernEngine};
pub use environment::{EnvironmentBackend, EnvironmentOrchestrator, ExecutionEnvironment};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use job::{JobStatus, JobStatusView, QueryJob, QueryResult};
pub use operations::{Request, Response};
pub use reaper::{ExpiryReaper, ReapReport};
pub use registry::SessionRegistry;
pub use scheduler::{EngineMode, QueryScheduler};
pub use service::{AnalysisService, ServiceBuilder};
pub use session::{
    CreateSessionRequest, Credential, Language, Session, SessionOptions, SessionStatus,
    SourceDescriptor, SourceKind,
};
pub use templates::QueryTemplate;
