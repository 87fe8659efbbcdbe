//! Configuration validation

use super::error::{ConfigError, ConfigResult};
use super::{
    AppConfig, ArtifactConfig, EnvironmentConfig, QueryConfig, ReaperConfig, SessionsConfig,
    StorageBackend, StorageConfig,
};

// ═══════════════════════════════════════════════════════════════════════════
// Validatable Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Trait for validatable configuration sections
pub trait Validatable {
    /// Returns `Ok(())` if valid, `Err(ConfigError)` with details if invalid.
    fn validate(&self) -> ConfigResult<()>;

    /// Section name for error messages
    fn config_name(&self) -> &'static str {
        "config"
    }
}

/// Ten years; retention and cache lifetimes above this are configuration mistakes
pub const MAX_RETENTION_SECONDS: u64 = 10 * 365 * 24 * 3600;

fn check_range<T>(field: &str, value: T, min: T, max: T, hint: &str) -> ConfigResult<()>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if value < min || value > max {
        return Err(ConfigError::range(field, value, min, max, hint));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Section Validators
// ═══════════════════════════════════════════════════════════════════════════

impl Validatable for SessionsConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "sessions.max_concurrent",
            self.max_concurrent,
            1,
            10_000,
            "At least one session must be admissible.",
        )?;
        check_range(
            "sessions.max_ttl_seconds",
            self.max_ttl_seconds,
            60,
            7 * 24 * 3600,
            "Upper bound for per-session ttl requests.",
        )?;
        check_range(
            "sessions.default_ttl_seconds",
            self.default_ttl_seconds,
            60,
            self.max_ttl_seconds,
            "Default ttl cannot exceed sessions.max_ttl_seconds.",
        )?;
        check_range(
            "sessions.default_idle_timeout_seconds",
            self.default_idle_timeout_seconds,
            10,
            self.max_ttl_seconds,
            "Idle timeout cannot exceed sessions.max_ttl_seconds.",
        )?;
        check_range(
            "sessions.max_source_size_mb",
            self.max_source_size_mb,
            1,
            100_000,
            "Size cap for acquired sources.",
        )?;
        check_range(
            "sessions.closed_retention_seconds",
            self.closed_retention_seconds,
            1,
            MAX_RETENTION_SECONDS,
            "How long CLOSED / ERROR records are kept.",
        )?;
        if self.workspace_root.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "sessions.workspace_root must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "sessions"
    }
}

impl Validatable for EnvironmentConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "environment.cpu_limit",
            self.cpu_limit,
            0.1,
            256.0,
            "Fractional CPUs granted to each environment.",
        )?;
        check_range(
            "environment.max_concurrent_starts",
            self.max_concurrent_starts,
            1,
            1_000,
            "Bounds simultaneous environment start-ups.",
        )?;
        check_range(
            "environment.start_timeout_seconds",
            self.start_timeout_seconds,
            1,
            3_600,
            "Deadline for obtaining a start slot.",
        )?;
        let memory = self.memory_limit.trim().to_ascii_lowercase();
        let digits = memory.trim_end_matches(|c| matches!(c, 'b' | 'k' | 'm' | 'g'));
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::Validation(format!(
                "environment.memory_limit '{}' must look like 512m or 4g",
                self.memory_limit
            )));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "environment"
    }
}

impl Validatable for ArtifactConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "artifact.build_timeout_seconds",
            self.build_timeout_seconds,
            1,
            24 * 3600,
            "Artifact generation deadline.",
        )?;
        check_range(
            "artifact.min_artifact_bytes",
            self.min_artifact_bytes,
            0,
            1 << 30,
            "Artifacts smaller than this are treated as failed builds.",
        )?;
        if self.max_total_size_bytes == 0 {
            return Err(ConfigError::range(
                "artifact.max_total_size_bytes",
                0,
                1,
                u64::MAX,
                "A zero ceiling would evict every artifact.",
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "artifact"
    }
}

impl Validatable for QueryConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "query.max_timeout_seconds",
            self.max_timeout_seconds,
            1,
            3_600,
            "Upper bound for per-query timeouts.",
        )?;
        check_range(
            "query.default_timeout_seconds",
            self.default_timeout_seconds,
            1,
            self.max_timeout_seconds,
            "Default timeout cannot exceed query.max_timeout_seconds.",
        )?;
        check_range(
            "query.max_limit",
            self.max_limit,
            1,
            1_000_000,
            "Upper bound for result rows.",
        )?;
        check_range(
            "query.max_offset",
            self.max_offset,
            0,
            100_000_000,
            "Upper bound for skipped result rows.",
        )?;
        check_range(
            "query.default_limit",
            self.default_limit,
            1,
            self.max_limit,
            "Default limit cannot exceed query.max_limit.",
        )?;
        check_range(
            "query.max_query_length",
            self.max_query_length,
            1,
            1_000_000,
            "Maximum accepted query text length.",
        )?;
        check_range(
            "query.max_concurrent_jobs",
            self.max_concurrent_jobs,
            1,
            10_000,
            "Global bound on running async jobs.",
        )?;
        check_range(
            "query.cache_ttl_seconds",
            self.cache_ttl_seconds,
            1,
            MAX_RETENTION_SECONDS,
            "Lifetime of cached query results.",
        )?;
        check_range(
            "query.cache_max_entries",
            self.cache_max_entries,
            1,
            100_000_000,
            "Result cache capacity.",
        )?;
        check_range(
            "query.job_retention_seconds",
            self.job_retention_seconds,
            1,
            MAX_RETENTION_SECONDS,
            "How long finished async jobs stay pollable.",
        )?;
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "query"
    }
}

impl Validatable for ReaperConfig {
    // interval_seconds = 0 is accepted and coerced when the reaper starts
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "reaper.interval_seconds",
            self.interval_seconds,
            0,
            24 * 3600,
            "Reaper pass interval.",
        )
    }

    fn config_name(&self) -> &'static str {
        "reaper"
    }
}

impl Validatable for StorageConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.backend == StorageBackend::Sqlite && self.sqlite_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "storage.sqlite_path is required for the sqlite backend".to_string(),
            ));
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "storage"
    }
}

impl Validatable for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.sessions.validate()?;
        self.environment.validate()?;
        self.artifact.validate()?;
        self.query.validate()?;
        self.reaper.validate()?;
        self.storage.validate()?;
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "app"
    }
}
