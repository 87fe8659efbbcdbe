//! Store errors
//!
//! Callers branch on `kind`; `message` is for logs.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// SQLite rejected the statement or the file
    Database,
    /// A stored value is not the JSON the caller asked for
    Serialization,
    /// Store shut down or its worker died
    Unavailable,
    /// Empty key or similar caller mistake
    InvalidArgument,
    /// Database directory could not be created
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Io => "io",
        })
    }
}

#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StorageError {
    fn of(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    fn caused_by(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::of(ErrorKind::InvalidArgument, message)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::of(ErrorKind::Database, format!("sqlite: {}", err)).caused_by(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::of(ErrorKind::Serialization, format!("stored value: {}", err)).caused_by(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::of(ErrorKind::Io, format!("filesystem: {}", err)).caused_by(err)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_unavailable_display() {
        let err = StorageError::unavailable("sqlite worker failed");
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "[unavailable] sqlite worker failed");
    }

    #[test]
    fn test_io_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let err: StorageError = io_err.into();

        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.source().unwrap().to_string().contains("read-only fs"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();

        assert_eq!(err.kind, ErrorKind::Database);
        assert!(err.message.starts_with("sqlite: "));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_bad_json_is_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: StorageError = json_err.into();

        assert_eq!(err.kind, ErrorKind::Serialization);
        assert_eq!(err.to_string().split(']').next(), Some("[serialization"));
    }
}
