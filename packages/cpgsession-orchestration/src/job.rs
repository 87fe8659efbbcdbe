use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::query::Row;

// ═══════════════════════════════════════════════════════════════════════════
// Query result
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of one query execution
///
/// Serialized with the `success` flag clients expect:
///
/// ```json
/// {"success":true,"data":[{"name":"main"}],"row_count":1,"execution_time":0.2}
/// {"success":false,"error":"...","error_kind":"query_timeout","execution_time":30.0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "QueryResultWire", try_from = "QueryResultWire")]
pub enum QueryResult {
    Success {
        data: Vec<Row>,
        row_count: usize,
        /// Seconds
        execution_time: f64,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        execution_time: f64,
    },
}

impl QueryResult {
    pub fn success(data: Vec<Row>, execution_time: f64) -> Self {
        QueryResult::Success {
            row_count: data.len(),
            data,
            execution_time,
        }
    }

    pub fn failure(error: &OrchestratorError, execution_time: f64) -> Self {
        QueryResult::Failure {
            kind: error.kind(),
            message: error.message(),
            execution_time,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, QueryResult::Success { .. })
    }

    pub fn execution_time(&self) -> f64 {
        match self {
            QueryResult::Success { execution_time, .. }
            | QueryResult::Failure { execution_time, .. } => *execution_time,
        }
    }

    pub fn with_execution_time(mut self, seconds: f64) -> Self {
        match &mut self {
            QueryResult::Success { execution_time, .. }
            | QueryResult::Failure { execution_time, .. } => *execution_time = seconds,
        }
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            QueryResult::Success { .. } => None,
            QueryResult::Failure { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueryResultWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(default)]
    execution_time: f64,
}

impl From<QueryResult> for QueryResultWire {
    fn from(result: QueryResult) -> Self {
        match result {
            QueryResult::Success {
                data,
                row_count,
                execution_time,
            } => QueryResultWire {
                success: true,
                data: Some(data),
                row_count: Some(row_count),
                error: None,
                error_kind: None,
                execution_time,
            },
            QueryResult::Failure {
                kind,
                message,
                execution_time,
            } => QueryResultWire {
                success: false,
                data: None,
                row_count: None,
                error: Some(message),
                error_kind: Some(kind),
                execution_time,
            },
        }
    }
}

impl TryFrom<QueryResultWire> for QueryResult {
    type Error = String;

    fn try_from(wire: QueryResultWire) -> std::result::Result<Self, Self::Error> {
        if wire.success {
            let data = wire.data.unwrap_or_default();
            Ok(QueryResult::Success {
                row_count: wire.row_count.unwrap_or(data.len()),
                data,
                execution_time: wire.execution_time,
            })
        } else {
            Ok(QueryResult::Failure {
                kind: wire.error_kind.unwrap_or(ErrorKind::QueryExecutionError),
                message: wire
                    .error
                    .ok_or_else(|| "failed result without error message".to_string())?,
                execution_time: wire.execution_time,
            })
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Async query jobs
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryJob {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    pub result_limit: usize,
    #[serde(default)]
    pub result_offset: usize,
    pub result: Option<QueryResult>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl QueryJob {
    pub fn new_pending(session_id: &str, query: &str, timeout_seconds: u64, result_limit: usize) -> Self {
        Self::new_pending_page(session_id, query, timeout_seconds, result_limit, 0)
    }

    pub fn new_pending_page(
        session_id: &str,
        query: &str,
        timeout_seconds: u64,
        result_limit: usize,
        result_offset: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            query: query.to_string(),
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds,
            result_limit,
            result_offset,
            result: None,
            error: None,
            error_kind: None,
        }
    }

    fn invalid(&self, to: JobStatus) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    /// Transition: PENDING → RUNNING
    pub fn start(&mut self) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transition: RUNNING → COMPLETED | FAILED | TIMEOUT, driven by the result
    pub fn finish(&mut self, result: QueryResult) -> Result<()> {
        let target = match &result {
            QueryResult::Success { .. } => JobStatus::Completed,
            QueryResult::Failure {
                kind: ErrorKind::QueryTimeout,
                ..
            } => JobStatus::Timeout,
            QueryResult::Failure { .. } => JobStatus::Failed,
        };
        if self.status != JobStatus::Running {
            return Err(self.invalid(target));
        }
        if let QueryResult::Failure { kind, message, .. } = &result {
            self.error = Some(message.clone());
            self.error_kind = Some(*kind);
        }
        self.status = target;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Transition: PENDING | RUNNING → FAILED
    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid(JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.error = Some(reason.to_string());
        self.error_kind = Some(ErrorKind::QueryExecutionError);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal and finished more than `retention` ago
    pub fn is_expired_at(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        match (self.status.is_terminal(), self.completed_at) {
            (true, Some(done)) => now - done > retention,
            _ => false,
        }
    }

    /// The stored result, or the recorded failure as an error
    pub fn outcome(&self) -> Result<QueryResult> {
        match self.status {
            JobStatus::Pending | JobStatus::Running => Err(OrchestratorError::NotReady(format!(
                "job '{}' is {}",
                self.id, self.status
            ))),
            JobStatus::Completed => self
                .result
                .clone()
                .ok_or_else(|| OrchestratorError::internal("completed job without result")),
            JobStatus::Failed | JobStatus::Timeout => {
                let kind = self.error_kind.unwrap_or(match self.status {
                    JobStatus::Timeout => ErrorKind::QueryTimeout,
                    _ => ErrorKind::QueryExecutionError,
                });
                Err(OrchestratorError::from_kind(
                    kind,
                    self.error.clone().unwrap_or_else(|| "query failed".to_string()),
                ))
            }
        }
    }
}

/// What `pollStatus` reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl From<&QueryJob> for JobStatusView {
    fn from(job: &QueryJob) -> Self {
        Self {
            job_id: job.id.clone(),
            session_id: job.session_id.clone(),
            status: job.status,
            submitted_at: job.submitted_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
            error_kind: job.error_kind,
        }
    }
}
