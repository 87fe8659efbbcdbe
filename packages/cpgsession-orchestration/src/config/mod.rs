//! Application configuration
//!
//! Layering, lowest precedence first:
//!
//! 1. Built-in defaults (`AppConfig::default()`)
//! 2. YAML file (schema v1, `version: 1` required, unknown fields rejected)
//! 3. `CPGSESSION_*` environment overrides
//!
//! followed by `validate()`.
//!
//! ```yaml
//! version: 1
//! sessions:
//!   max_concurrent: 20
//!   workspace_root: /var/lib/cpgsession
//! environment:
//!   backend: docker
//!   image: joern:latest
//! query:
//!   default_timeout_seconds: 60
//! ```

pub mod error;
pub mod io;
pub mod validation;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{ConfigError, ConfigResult};
pub use io::{ConfigFileV1, SUPPORTED_VERSIONS};
pub use validation::{Validatable, MAX_RETENTION_SECONDS};

/// Whole seconds as a signed span, saturating instead of wrapping
pub fn signed_seconds(seconds: u64) -> chrono::Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub sessions: SessionsConfig,
    pub environment: EnvironmentConfig,
    pub artifact: ArtifactConfig,
    pub query: QueryConfig,
    pub reaper: ReaperConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

// ═══════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SessionsConfig {
    pub default_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    pub default_idle_timeout_seconds: u64,
    /// Live (CREATING + READY) session ceiling
    pub max_concurrent: usize,
    pub max_source_size_mb: u64,
    /// Private workspaces live under `<workspace_root>/sessions/<id>`
    pub workspace_root: PathBuf,
    /// CLOSED / ERROR records are dropped this long after they settle
    pub closed_retention_seconds: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
            max_ttl_seconds: 24 * 3600,
            default_idle_timeout_seconds: 1800,
            max_concurrent: 100,
            max_source_size_mb: 500,
            workspace_root: PathBuf::from("/tmp/cpgsession"),
            closed_retention_seconds: 3600,
        }
    }
}

impl SessionsConfig {
    pub fn max_source_size_bytes(&self) -> u64 {
        self.max_source_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_root.join("sessions")
    }

    pub fn closed_retention(&self) -> chrono::Duration {
        signed_seconds(self.closed_retention_seconds)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Environment
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentBackendKind {
    /// One container per session via the docker CLI
    Docker,
    /// Host processes rooted in the session workspace
    Local,
}

impl std::str::FromStr for EnvironmentBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown environment backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub backend: EnvironmentBackendKind,
    pub image: String,
    pub docker_binary: String,
    /// Fractional CPUs per environment
    pub cpu_limit: f64,
    pub memory_limit: String,
    /// Shared read-only directory mounted at `/playground`
    pub auxiliary_path: Option<PathBuf>,
    pub max_concurrent_starts: usize,
    pub start_timeout_seconds: u64,
    /// Engine installation directory as seen from inside the environment
    pub engine_home: PathBuf,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            backend: EnvironmentBackendKind::Docker,
            image: "joern:latest".to_string(),
            docker_binary: "docker".to_string(),
            cpu_limit: 2.0,
            memory_limit: "4g".to_string(),
            auxiliary_path: None,
            max_concurrent_starts: 4,
            start_timeout_seconds: 120,
            engine_home: PathBuf::from("/opt/joern/joern-cli"),
        }
    }
}

impl EnvironmentConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Artifact cache
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactConfig {
    pub cache_dir: PathBuf,
    pub build_timeout_seconds: u64,
    pub min_artifact_bytes: u64,
    pub max_total_size_bytes: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/cpgsession/artifacts"),
            build_timeout_seconds: 600,
            min_artifact_bytes: 1024,
            max_total_size_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl ArtifactConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_seconds)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Query
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub default_limit: usize,
    pub max_limit: usize,
    /// Largest number of leading rows a query may skip
    pub max_offset: usize,
    pub max_query_length: usize,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: u64,
    /// Keep one warm engine process per session
    pub persistent_enabled: bool,
    pub max_concurrent_jobs: usize,
    pub job_retention_seconds: u64,
}

impl QueryConfig {
    pub fn job_retention(&self) -> chrono::Duration {
        signed_seconds(self.job_retention_seconds)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            max_timeout_seconds: 300,
            default_limit: 150,
            max_limit: 10_000,
            max_offset: 1_000_000,
            max_query_length: 10_000,
            cache_ttl_seconds: 300,
            cache_max_entries: 10_000,
            persistent_enabled: true,
            max_concurrent_jobs: num_cpus::get().max(1) * 2,
            job_retention_seconds: 3600,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Reaper / storage / logging
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("/tmp/cpgsession/state.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
