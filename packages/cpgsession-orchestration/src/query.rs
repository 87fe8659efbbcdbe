//! Query admission checks and engine output parsing

use regex::{RegexSet, RegexSetBuilder};
use serde_json::{Map, Value};

use crate::config::QueryConfig;
use crate::error::{OrchestratorError, Result};

/// Patterns that reach outside the analysis sandbox
const FORBIDDEN_PATTERNS: &[&str] = &[
    r"System\.exit",
    r"Runtime\.getRuntime",
    r"ProcessBuilder",
    r"java\.io\.File.*delete",
];

/// One result row
pub type Row = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct QueryPolicy {
    max_query_length: usize,
    max_timeout_seconds: u64,
    max_limit: usize,
    max_offset: usize,
    forbidden: RegexSet,
}

impl QueryPolicy {
    pub fn new(config: &QueryConfig) -> Result<Self> {
        let forbidden = RegexSetBuilder::new(FORBIDDEN_PATTERNS)
            .case_insensitive(true)
            .build()
            .map_err(OrchestratorError::internal)?;
        Ok(Self {
            max_query_length: config.max_query_length,
            max_timeout_seconds: config.max_timeout_seconds,
            max_limit: config.max_limit,
            max_offset: config.max_offset,
            forbidden,
        })
    }

    pub fn validate(&self, query: &str, timeout_seconds: u64, limit: usize, offset: usize) -> Result<()> {
        if query.trim().is_empty() {
            return Err(OrchestratorError::validation("query must not be empty"));
        }
        let length = query.chars().count();
        if length > self.max_query_length {
            return Err(OrchestratorError::Validation(format!(
                "query is {} characters, maximum is {}",
                length, self.max_query_length
            )));
        }
        if self.forbidden.is_match(query) {
            return Err(OrchestratorError::validation(
                "query contains a forbidden operation",
            ));
        }
        if timeout_seconds == 0 || timeout_seconds > self.max_timeout_seconds {
            return Err(OrchestratorError::Validation(format!(
                "timeout must be between 1 and {} seconds",
                self.max_timeout_seconds
            )));
        }
        if limit == 0 || limit > self.max_limit {
            return Err(OrchestratorError::Validation(format!(
                "limit must be between 1 and {}",
                self.max_limit
            )));
        }
        if offset > self.max_offset {
            return Err(OrchestratorError::Validation(format!(
                "offset must be at most {}",
                self.max_offset
            )));
        }
        Ok(())
    }
}

fn value_row(value: Value) -> Row {
    let mut row = Map::new();
    row.insert("value".to_string(), value);
    row
}

/// Turn the engine's output file into at most `limit` rows
///
/// Empty output is zero rows; anything that is not JSON becomes a single
/// `{"value": <raw text>}` row.
pub fn parse_output(raw: &str, limit: usize) -> Vec<Row> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut rows: Vec<Row> = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => map,
                other => value_row(other),
            })
            .collect(),
        Ok(Value::Object(map)) => vec![map],
        Ok(scalar) => vec![value_row(scalar)],
        Err(_) => vec![value_row(Value::String(trimmed.to_string()))],
    };
    rows.truncate(limit);
    rows
}
