use cpgsession_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Machine-readable error kind reported at the operation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ValidationError,
    ResourceExhausted,
    ProvisioningError,
    BuildError,
    BuildTimeout,
    QueryExecutionError,
    QueryTimeout,
    DependencyUnavailable,
    NotReady,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ProvisioningError => "provisioning_error",
            ErrorKind::BuildError => "build_error",
            ErrorKind::BuildTimeout => "build_timeout",
            ErrorKind::QueryExecutionError => "query_execution_error",
            ErrorKind::QueryTimeout => "query_timeout",
            ErrorKind::DependencyUnavailable => "dependency_unavailable",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Artifact build failed: {0}")]
    Build(String),

    #[error("Artifact build timed out: {0}")]
    BuildTimeout(String),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Query timed out: {0}")]
    QueryTimeout(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn not_found(what: impl std::fmt::Display, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} '{}'", what, id))
    }

    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::Validation(_) | OrchestratorError::Config(_) => {
                ErrorKind::ValidationError
            }
            OrchestratorError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            OrchestratorError::Provisioning(_) => ErrorKind::ProvisioningError,
            OrchestratorError::Build(_) => ErrorKind::BuildError,
            OrchestratorError::BuildTimeout(_) => ErrorKind::BuildTimeout,
            OrchestratorError::QueryExecution(_) => ErrorKind::QueryExecutionError,
            OrchestratorError::QueryTimeout(_) => ErrorKind::QueryTimeout,
            OrchestratorError::DependencyUnavailable(_) | OrchestratorError::Storage(_) => {
                ErrorKind::DependencyUnavailable
            }
            OrchestratorError::NotReady(_) => ErrorKind::NotReady,
            OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::Io(_)
            | OrchestratorError::Json(_)
            | OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Human-readable message without the kind prefix
    pub fn message(&self) -> String {
        match self {
            OrchestratorError::NotFound(m)
            | OrchestratorError::Validation(m)
            | OrchestratorError::ResourceExhausted(m)
            | OrchestratorError::Provisioning(m)
            | OrchestratorError::Build(m)
            | OrchestratorError::BuildTimeout(m)
            | OrchestratorError::QueryExecution(m)
            | OrchestratorError::QueryTimeout(m)
            | OrchestratorError::DependencyUnavailable(m)
            | OrchestratorError::NotReady(m)
            | OrchestratorError::Internal(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a recorded kind (used when replaying terminal job state)
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::ValidationError => Self::Validation(message),
            ErrorKind::ResourceExhausted => Self::ResourceExhausted(message),
            ErrorKind::ProvisioningError => Self::Provisioning(message),
            ErrorKind::BuildError => Self::Build(message),
            ErrorKind::BuildTimeout => Self::BuildTimeout(message),
            ErrorKind::QueryExecutionError => Self::QueryExecution(message),
            ErrorKind::QueryTimeout => Self::QueryTimeout(message),
            ErrorKind::DependencyUnavailable => Self::DependencyUnavailable(message),
            ErrorKind::NotReady => Self::NotReady(message),
            ErrorKind::Internal => Self::Internal(message),
        }
    }
}
