//! Session records and their state machine
//!
//! ```text
//! CREATING ──► READY ──► CLOSED
//!     │          │
//!     └──► ERROR ┴──────► CLOSED
//! ```
//!
//! Records are plain data; the registry owns them and persists every
//! transition under `session:<id>`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::signed_seconds;
use crate::environment::ExecutionEnvironment;
use crate::error::{OrchestratorError, Result};

/// Source languages the engine has a frontend for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    C,
    Cpp,
    Javascript,
    Python,
    Go,
    Kotlin,
    Csharp,
    Ghidra,
    Jimple,
    Php,
    Ruby,
    Swift,
}

impl Language {
    pub const ALL: [Language; 13] = [
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::Javascript,
        Language::Python,
        Language::Go,
        Language::Kotlin,
        Language::Csharp,
        Language::Ghidra,
        Language::Jimple,
        Language::Php,
        Language::Ruby,
        Language::Swift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Javascript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
            Language::Kotlin => "kotlin",
            Language::Csharp => "csharp",
            Language::Ghidra => "ghidra",
            Language::Jimple => "jimple",
            Language::Php => "php",
            Language::Ruby => "ruby",
            Language::Swift => "swift",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        Language::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == lowered)
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "unsupported language '{}'; supported: {}",
                    s,
                    Language::ALL.map(|l| l.as_str()).join(", ")
                ))
            })
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    Local,
    Remote,
}

impl SourceKind {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SourceKind::Local),
            "remote" | "github" | "git" => Ok(SourceKind::Remote),
            other => Err(OrchestratorError::Validation(format!(
                "unsupported source kind '{}'; expected local or remote",
                other
            ))),
        }
    }
}

/// Access token for a remote source; never serialized, redacted in Debug
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// Absolute directory path (LOCAL) or repository URL (REMOTE)
    pub location: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip)]
    pub credential: Option<Credential>,
}

impl SourceDescriptor {
    pub fn local(path: impl Into<String>, language: Language) -> Self {
        Self {
            kind: SourceKind::Local,
            location: path.into(),
            language,
            branch: None,
            credential: None,
        }
    }

    pub fn remote(url: impl Into<String>, language: Language) -> Self {
        Self {
            kind: SourceKind::Remote,
            location: url.into(),
            language,
            branch: None,
            credential: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

/// Optional per-session knobs; unset values fall back to config defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub exclusion_patterns: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    pub source: SourceDescriptor,
    pub options: SessionOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Creating,
    Ready,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "CREATING",
            SessionStatus::Ready => "READY",
            SessionStatus::Error => "ERROR",
            SessionStatus::Closed => "CLOSED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATING" => Ok(SessionStatus::Creating),
            "READY" => Ok(SessionStatus::Ready),
            "ERROR" => Ok(SessionStatus::Error),
            "CLOSED" => Ok(SessionStatus::Closed),
            other => Err(OrchestratorError::Validation(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }

    /// Counts against `sessions.max_concurrent`
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Creating | SessionStatus::Ready)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub source: SourceDescriptor,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub idle_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<ExecutionEnvironment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exclusion_patterns: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Session {
    pub fn new_creating(
        source: SourceDescriptor,
        ttl_seconds: u64,
        idle_timeout_seconds: u64,
        exclusion_patterns: Vec<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Creating,
            source,
            created_at: now,
            last_accessed_at: now,
            ttl_seconds,
            idle_timeout_seconds,
            environment: None,
            artifact_key: None,
            error_message: None,
            closed_at: None,
            exclusion_patterns,
            metadata,
        }
    }

    fn transition_error(&self, to: SessionStatus) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    /// Transition: CREATING → READY
    pub fn mark_ready(&mut self, artifact_key: String) -> Result<()> {
        if self.status != SessionStatus::Creating {
            return Err(self.transition_error(SessionStatus::Ready));
        }
        self.status = SessionStatus::Ready;
        self.artifact_key = Some(artifact_key);
        self.last_accessed_at = Utc::now();
        Ok(())
    }

    /// Transition: CREATING → ERROR
    pub fn mark_error(&mut self, message: impl Into<String>) -> Result<()> {
        if self.status != SessionStatus::Creating {
            return Err(self.transition_error(SessionStatus::Error));
        }
        self.status = SessionStatus::Error;
        self.error_message = Some(message.into());
        self.environment = None;
        self.source.credential = None;
        Ok(())
    }

    /// Transition: * → CLOSED (idempotent)
    pub fn mark_closed(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        self.status = SessionStatus::Closed;
        self.environment = None;
        self.source.credential = None;
        self.closed_at = Some(Utc::now());
    }

    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
    }

    pub fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_accessed_at > signed_seconds(self.idle_timeout_seconds)
    }

    pub fn is_past_ttl_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > signed_seconds(self.ttl_seconds)
    }

    /// Reason string if the session should be reaped at `now`
    pub fn expiry_reason_at(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if !self.status.is_live() {
            return None;
        }
        if self.is_past_ttl_at(now) {
            Some("ttl")
        } else if self.is_idle_at(now) {
            Some("idle")
        } else {
            None
        }
    }

    /// Moment after which a settled (CLOSED/ERROR) record may be dropped
    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            SessionStatus::Closed => self.closed_at.or(Some(self.last_accessed_at)),
            SessionStatus::Error => Some(self.last_accessed_at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> Session {
        Session::new_creating(
            SourceDescriptor::local("/src/app", Language::Java),
            3600,
            5,
            Vec::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_language_parse() {
        assert_eq!(Language::from_str("Java").unwrap(), Language::Java);
        assert_eq!(Language::from_str("cpp").unwrap(), Language::Cpp);
        let err = Language::from_str("cobol").unwrap_err();
        assert!(err.message().contains("unsupported language"));
    }

    #[test]
    fn test_credential_never_serialized() {
        let source = SourceDescriptor::remote("https://github.com/a/b", Language::Go)
            .with_credential(Credential::new("ghp_secret"));

        let json = serde_json::to_string(&source).unwrap();
        assert!(!json.contains("ghp_secret"));
        assert!(!format!("{:?}", source).contains("ghp_secret"));
    }

    #[test]
    fn test_creating_to_ready() {
        let mut s = session();
        s.mark_ready("abc".to_string()).unwrap();
        assert_eq!(s.status, SessionStatus::Ready);
        assert_eq!(s.artifact_key.as_deref(), Some("abc"));
    }

    #[test]
    fn test_ready_to_error_rejected() {
        let mut s = session();
        s.mark_ready("abc".to_string()).unwrap();
        assert!(matches!(
            s.mark_error("boom"),
            Err(OrchestratorError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut s = session();
        s.mark_closed();
        let first = s.closed_at;
        s.mark_closed();
        assert_eq!(s.closed_at, first);
        assert!(!s.status.is_live());
    }

    #[test]
    fn test_idle_and_ttl_expiry() {
        let s = session();
        let base = s.last_accessed_at;

        assert_eq!(s.expiry_reason_at(base + Duration::seconds(4)), None);
        assert_eq!(s.expiry_reason_at(base + Duration::seconds(6)), Some("idle"));
        assert_eq!(s.expiry_reason_at(base + Duration::seconds(3601)), Some("ttl"));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let mut s = session();
        let later = s.last_accessed_at + Duration::seconds(10);
        s.touch_at(later);
        s.touch_at(later - Duration::seconds(5));
        assert_eq!(s.last_accessed_at, later);
    }
}
