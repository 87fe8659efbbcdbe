//! Request/response boundary
//!
//! One JSON object per request, tagged by `op`:
//!
//! ```json
//! {"id":1,"op":"create_session","source_kind":"local","location":"/src/app","language":"python"}
//! {"id":2,"op":"execute_query","session_id":"...","query":"cpg.method.name.l","limit":10}
//! ```
//!
//! Templated operations (`list_methods`, `get_method_source`, `list_calls`,
//! `find_taint_sources`, `find_taint_sinks`) build their query server-side
//! and run it synchronously.
//!
//! Every response is either `{"id":..,"ok":true,"data":..}` or
//! `{"id":..,"ok":false,"error":{"kind":"not_found","message":".."}}`.
//! Enum-valued fields arrive as strings so bad values surface as
//! `validation_error` rather than parse failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::service::AnalysisService;
use crate::session::{
    CreateSessionRequest, Credential, Language, SessionOptions, SessionStatus, SourceDescriptor,
    SourceKind,
};
use crate::templates::QueryTemplate;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        source_kind: String,
        location: String,
        language: String,
        #[serde(default)]
        branch: Option<String>,
        /// Redacted in Debug output
        #[serde(default)]
        credential: Option<Credential>,
        #[serde(default)]
        options: SessionOptions,
    },
    GetSession {
        session_id: String,
    },
    ListSessions {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        source_kind: Option<String>,
    },
    TouchSession {
        session_id: String,
    },
    CloseSession {
        session_id: String,
    },
    ExecuteQuery {
        session_id: String,
        query: String,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: Option<usize>,
    },
    SubmitQuery {
        session_id: String,
        query: String,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: Option<usize>,
    },
    ListMethods {
        session_id: String,
        #[serde(default)]
        name_pattern: Option<String>,
        #[serde(default)]
        file_pattern: Option<String>,
        #[serde(default)]
        callee_pattern: Option<String>,
        #[serde(default)]
        include_external: bool,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: Option<usize>,
    },
    GetMethodSource {
        session_id: String,
        method_name: String,
        #[serde(default)]
        filename: Option<String>,
    },
    ListCalls {
        session_id: String,
        #[serde(default)]
        caller_pattern: Option<String>,
        #[serde(default)]
        callee_pattern: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        offset: Option<usize>,
    },
    FindTaintSources {
        session_id: String,
        #[serde(default)]
        patterns: Vec<String>,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    FindTaintSinks {
        session_id: String,
        #[serde(default)]
        patterns: Vec<String>,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
    QueryStatus {
        job_id: String,
    },
    QueryResult {
        job_id: String,
    },
    ListJobs {
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// A request plus the caller's correlation id
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            id: None,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &OrchestratorError) -> Self {
        Self {
            id: None,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind(),
                message: err.message(),
            }),
        }
    }

    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }
}

impl From<Result<Value>> for Response {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(data) => Response::success(data),
            Err(e) => Response::failure(&e),
        }
    }
}

impl Request {
    /// Everything checkable without touching the service
    fn build_create(
        source_kind: &str,
        location: String,
        language: &str,
        branch: Option<String>,
        credential: Option<Credential>,
        options: SessionOptions,
    ) -> Result<CreateSessionRequest> {
        let kind = SourceKind::from_str(source_kind)?;
        let language = Language::from_str(language)?;
        let mut source = match kind {
            SourceKind::Local => SourceDescriptor::local(location, language),
            SourceKind::Remote => SourceDescriptor::remote(location, language),
        };
        if let Some(branch) = branch {
            source = source.with_branch(branch);
        }
        if let Some(credential) = credential.filter(|c| !c.expose().is_empty()) {
            source = source.with_credential(credential);
        }
        Ok(CreateSessionRequest { source, options })
    }

    /// Session and query text for templated operations; `None` for the rest
    pub fn template(&self) -> Option<(&str, QueryTemplate)> {
        let built = match self {
            Request::ListMethods {
                session_id,
                name_pattern,
                file_pattern,
                callee_pattern,
                include_external,
                ..
            } => (
                session_id,
                QueryTemplate::ListMethods {
                    name_pattern: name_pattern.clone(),
                    file_pattern: file_pattern.clone(),
                    callee_pattern: callee_pattern.clone(),
                    include_external: *include_external,
                },
            ),
            Request::GetMethodSource {
                session_id,
                method_name,
                filename,
            } => (
                session_id,
                QueryTemplate::GetMethodSource {
                    method_name: method_name.clone(),
                    filename: filename.clone(),
                },
            ),
            Request::ListCalls {
                session_id,
                caller_pattern,
                callee_pattern,
                ..
            } => (
                session_id,
                QueryTemplate::ListCalls {
                    caller_pattern: caller_pattern.clone(),
                    callee_pattern: callee_pattern.clone(),
                },
            ),
            Request::FindTaintSources {
                session_id,
                patterns,
                filename,
                ..
            } => (
                session_id,
                QueryTemplate::TaintSources {
                    patterns: patterns.clone(),
                    filename: filename.clone(),
                },
            ),
            Request::FindTaintSinks {
                session_id,
                patterns,
                filename,
                ..
            } => (
                session_id,
                QueryTemplate::TaintSinks {
                    patterns: patterns.clone(),
                    filename: filename.clone(),
                },
            ),
            _ => return None,
        };
        Some((built.0.as_str(), built.1))
    }

    /// Row window requested by a templated operation
    fn template_window(&self) -> (Option<usize>, Option<usize>) {
        match self {
            Request::ListMethods { limit, offset, .. } | Request::ListCalls { limit, offset, .. } => {
                (*limit, *offset)
            }
            Request::FindTaintSources { limit, .. } | Request::FindTaintSinks { limit, .. } => {
                (*limit, None)
            }
            _ => (None, None),
        }
    }
}

/// Dispatch one request against the service
pub async fn handle(service: &AnalysisService, request: Request) -> Response {
    dispatch(service, request).await.into()
}

async fn dispatch(service: &AnalysisService, request: Request) -> Result<Value> {
    if let Some((session_id, template)) = request.template() {
        let (limit, offset) = request.template_window();
        let result = service
            .run_template(session_id, &template, None, limit, offset)
            .await?;
        return Ok(serde_json::to_value(result)?);
    }

    let value = match request {
        Request::CreateSession {
            source_kind,
            location,
            language,
            branch,
            credential,
            options,
        } => {
            let create = Request::build_create(
                &source_kind,
                location,
                &language,
                branch,
                credential,
                options,
            )?;
            serde_json::to_value(service.create_session(create).await?)?
        }
        Request::GetSession { session_id } => serde_json::to_value(service.get_session(&session_id)?)?,
        Request::ListSessions {
            status,
            source_kind,
        } => {
            let status = status.as_deref().map(SessionStatus::from_str).transpose()?;
            let kind = source_kind.as_deref().map(SourceKind::from_str).transpose()?;
            serde_json::to_value(service.list_sessions(status, kind))?
        }
        Request::TouchSession { session_id } => {
            serde_json::to_value(service.touch_session(&session_id).await?)?
        }
        Request::CloseSession { session_id } => {
            serde_json::to_value(service.close_session(&session_id).await?)?
        }
        Request::ExecuteQuery {
            session_id,
            query,
            timeout_seconds,
            limit,
            offset,
        } => serde_json::to_value(
            service
                .execute_query(&session_id, &query, timeout_seconds, limit, offset)
                .await?,
        )?,
        Request::SubmitQuery {
            session_id,
            query,
            timeout_seconds,
            limit,
            offset,
        } => {
            let job_id = service
                .submit_query(&session_id, &query, timeout_seconds, limit, offset)
                .await?;
            serde_json::json!({ "job_id": job_id })
        }
        Request::QueryStatus { job_id } => serde_json::to_value(service.query_status(&job_id)?)?,
        Request::QueryResult { job_id } => serde_json::to_value(service.query_result(&job_id)?)?,
        Request::ListJobs { session_id } => {
            serde_json::to_value(service.list_jobs(session_id.as_deref()))?
        }
        Request::ListMethods { .. }
        | Request::GetMethodSource { .. }
        | Request::ListCalls { .. }
        | Request::FindTaintSources { .. }
        | Request::FindTaintSinks { .. } => {
            return Err(OrchestratorError::internal("templated request was not dispatched"))
        }
    };
    Ok(value)
}

/// Parse and dispatch one line of JSON
pub async fn handle_line(service: &AnalysisService, line: &str) -> Response {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => handle(service, envelope.request).await.with_id(envelope.id),
        Err(e) => Response::failure(&OrchestratorError::Validation(format!(
            "malformed request: {}",
            e
        ))),
    }
}
