//! Configuration I/O (YAML/Env loading)

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, ConfigResult};
use super::validation::Validatable;
use super::{
    AppConfig, ArtifactConfig, EnvironmentConfig, LoggingConfig, QueryConfig, ReaperConfig,
    SessionsConfig, StorageConfig,
};

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// YAML Schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileV1 {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub environment: EnvironmentConfig,

    #[serde(default)]
    pub artifact: ArtifactConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl From<ConfigFileV1> for AppConfig {
    fn from(file: ConfigFileV1) -> Self {
        AppConfig {
            sessions: file.sessions,
            environment: file.environment,
            artifact: file.artifact,
            query: file.query,
            reaper: file.reaper,
            storage: file.storage,
            logging: file.logging,
        }
    }
}

impl AppConfig {
    /// Parse a YAML document (no env overrides, no validation)
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;

        let version = value
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or(ConfigError::MissingVersion)?;
        let version = u32::try_from(version).unwrap_or(u32::MAX);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let file: ConfigFileV1 = serde_yaml::from_value(value)?;
        Ok(file.into())
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: 1,
            sessions: self.sessions.clone(),
            environment: self.environment.clone(),
            artifact: self.artifact.clone(),
            query: self.query.clone(),
            reaper: self.reaper.clone(),
            storage: self.storage.clone(),
            logging: self.logging.clone(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    /// File (or defaults) → `CPGSESSION_*` overrides → validation
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides_with(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CPGSESSION_WORKSPACE_ROOT") {
            self.sessions.workspace_root = v.into();
        }
        if let Some(v) = lookup("CPGSESSION_MAX_SESSIONS") {
            self.sessions.max_concurrent = parse_env("CPGSESSION_MAX_SESSIONS", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_SESSION_TTL") {
            self.sessions.default_ttl_seconds = parse_env("CPGSESSION_SESSION_TTL", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_IDLE_TIMEOUT") {
            self.sessions.default_idle_timeout_seconds = parse_env("CPGSESSION_IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_ENV_BACKEND") {
            self.environment.backend = parse_env("CPGSESSION_ENV_BACKEND", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_IMAGE") {
            self.environment.image = v;
        }
        if let Some(v) = lookup("CPGSESSION_CPU_LIMIT") {
            self.environment.cpu_limit = parse_env("CPGSESSION_CPU_LIMIT", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_MEMORY_LIMIT") {
            self.environment.memory_limit = v;
        }
        if let Some(v) = lookup("CPGSESSION_ENGINE_HOME") {
            self.environment.engine_home = v.into();
        }
        if let Some(v) = lookup("CPGSESSION_CACHE_DIR") {
            self.artifact.cache_dir = v.into();
        }
        if let Some(v) = lookup("CPGSESSION_BUILD_TIMEOUT") {
            self.artifact.build_timeout_seconds = parse_env("CPGSESSION_BUILD_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_QUERY_TIMEOUT") {
            self.query.default_timeout_seconds = parse_env("CPGSESSION_QUERY_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_QUERY_CACHE_TTL") {
            self.query.cache_ttl_seconds = parse_env("CPGSESSION_QUERY_CACHE_TTL", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_PERSISTENT_ENABLED") {
            self.query.persistent_enabled = parse_env("CPGSESSION_PERSISTENT_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_STORAGE_BACKEND") {
            self.storage.backend = parse_env("CPGSESSION_STORAGE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("CPGSESSION_SQLITE_PATH") {
            self.storage.sqlite_path = v.into();
        }
        if let Some(v) = lookup("CPGSESSION_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }
}

fn parse_env<T>(var: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvironmentBackendKind, StorageBackend};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = AppConfig::default();
        config.query.default_timeout_seconds = 45;

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));

        let parsed = AppConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_yaml_loading_partial_sections() {
        let yaml_content = r#"
version: 1
sessions:
  max_concurrent: 7
environment:
  backend: local
storage:
  backend: memory
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = AppConfig::from_yaml(temp_file.path()).unwrap();
        assert_eq!(config.sessions.max_concurrent, 7);
        assert_eq!(config.sessions.default_ttl_seconds, 3600);
        assert_eq!(config.environment.backend, EnvironmentBackendKind::Local);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = AppConfig::from_yaml_str("sessions:\n  max_concurrent: 3\n");
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let result = AppConfig::from_yaml_str("version: 2\n");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::UnsupportedVersion { found: 2, .. }
        ));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let result = AppConfig::from_yaml_str("version: 1\nquery:\n  turbo: true\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CPGSESSION_MAX_SESSIONS", "12"),
            ("CPGSESSION_ENV_BACKEND", "local"),
            ("CPGSESSION_PERSISTENT_ENABLED", "false"),
            ("CPGSESSION_WORKSPACE_ROOT", "/srv/cpg"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env_overrides_with(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.sessions.max_concurrent, 12);
        assert_eq!(config.environment.backend, EnvironmentBackendKind::Local);
        assert!(!config.query.persistent_enabled);
        assert_eq!(config.sessions.workspace_root, std::path::PathBuf::from("/srv/cpg"));
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides_with(|var| {
                (var == "CPGSESSION_QUERY_TIMEOUT").then(|| "soon".to_string())
            })
            .unwrap_err();

        match err {
            ConfigError::InvalidEnv { var, .. } => assert_eq!(var, "CPGSESSION_QUERY_TIMEOUT"),
            other => panic!("Expected InvalidEnv, got {:?}", other),
        }
    }
}
