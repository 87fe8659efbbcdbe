//! Canned CPGQL for common browsing and taint questions
//!
//! Templates only build query text. Limit and offset are applied by the
//! engine's normalization, and the text goes through the same policy checks
//! and execution path as a hand-written query.

use crate::error::{OrchestratorError, Result};

/// Input-reading calls matched when no source patterns are given
pub const DEFAULT_TAINT_SOURCES: &[&str] =
    &["getenv", "fgets", "scanf", "read", "recv", "accept", "fopen"];

/// Command and format-string calls matched when no sink patterns are given
pub const DEFAULT_TAINT_SINKS: &[&str] = &["system", "popen", "execl", "execv", "sprintf", "fprintf"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTemplate {
    ListMethods {
        name_pattern: Option<String>,
        file_pattern: Option<String>,
        callee_pattern: Option<String>,
        include_external: bool,
    },
    GetMethodSource {
        method_name: String,
        filename: Option<String>,
    },
    ListCalls {
        caller_pattern: Option<String>,
        callee_pattern: Option<String>,
    },
    TaintSources {
        patterns: Vec<String>,
        filename: Option<String>,
    },
    TaintSinks {
        patterns: Vec<String>,
        filename: Option<String>,
    },
}

impl QueryTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            QueryTemplate::ListMethods { .. } => "list_methods",
            QueryTemplate::GetMethodSource { .. } => "get_method_source",
            QueryTemplate::ListCalls { .. } => "list_calls",
            QueryTemplate::TaintSources { .. } => "find_taint_sources",
            QueryTemplate::TaintSinks { .. } => "find_taint_sinks",
        }
    }

    /// Single-line CPGQL without a row window or output conversion
    pub fn render(&self) -> Result<String> {
        let query = match self {
            QueryTemplate::ListMethods {
                name_pattern,
                file_pattern,
                callee_pattern,
                include_external,
            } => {
                let mut q = String::from("cpg.method");
                if !include_external {
                    q.push_str(".isExternal(false)");
                }
                if let Some(p) = present(name_pattern) {
                    q.push_str(&format!(".name({})", scala_string(p)));
                }
                if let Some(p) = present(file_pattern) {
                    q.push_str(&format!(".where(_.file.name({}))", scala_string(p)));
                }
                if let Some(p) = present(callee_pattern) {
                    q.push_str(&format!(".where(_.callOut.name({}))", scala_string(p)));
                }
                q.push_str(
                    ".map(m => (m.name, m.id, m.fullName, m.signature, m.filename, \
                     m.lineNumber.getOrElse(-1), m.isExternal)).dedup",
                );
                q
            }
            QueryTemplate::GetMethodSource {
                method_name,
                filename,
            } => {
                let name = method_name.trim();
                if name.is_empty() {
                    return Err(OrchestratorError::validation("method_name must not be empty"));
                }
                let mut q = format!("cpg.method.name({})", scala_string(name));
                if let Some(f) = present(filename) {
                    q.push_str(&format!(".filename({})", scala_string(&contains(f))));
                }
                q.push_str(
                    ".map(m => (m.name, m.filename, m.lineNumber.getOrElse(-1), \
                     m.lineNumberEnd.getOrElse(-1), m.code))",
                );
                q
            }
            QueryTemplate::ListCalls {
                caller_pattern,
                callee_pattern,
            } => {
                let mut q = String::from("cpg.call");
                if let Some(p) = present(callee_pattern) {
                    q.push_str(&format!(".name({})", scala_string(p)));
                }
                if let Some(p) = present(caller_pattern) {
                    q.push_str(&format!(".where(_.method.name({}))", scala_string(p)));
                }
                q.push_str(
                    ".map(c => (c.method.name, c.name, c.code, c.method.filename, \
                     c.lineNumber.getOrElse(-1))).dedup",
                );
                q
            }
            QueryTemplate::TaintSources { patterns, filename } => {
                call_sites(patterns, DEFAULT_TAINT_SOURCES, filename.as_deref())
            }
            QueryTemplate::TaintSinks { patterns, filename } => {
                call_sites(patterns, DEFAULT_TAINT_SINKS, filename.as_deref())
            }
        };
        Ok(query)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// `.*<literal>.*` with regex metacharacters in `literal` escaped
fn contains(literal: &str) -> String {
    format!(".*{}.*", regex::escape(literal))
}

/// Calls whose name matches any of `patterns` (or `defaults` when empty)
fn call_sites(patterns: &[String], defaults: &[&str], filename: Option<&str>) -> String {
    let names: Vec<String> = if patterns.iter().any(|p| !p.trim().is_empty()) {
        patterns
            .iter()
            .map(|p| p.trim().trim_end_matches('('))
            .filter(|p| !p.is_empty())
            .map(regex::escape)
            .collect()
    } else {
        defaults.iter().map(|p| regex::escape(p)).collect()
    };

    let mut q = format!("cpg.call.name({})", scala_string(&names.join("|")));
    if let Some(f) = filename.map(str::trim).filter(|f| !f.is_empty()) {
        q.push_str(&format!(".where(_.file.name({}))", scala_string(&contains(f))));
    }
    q.push_str(
        ".map(c => (c.id, c.name, c.code, c.file.name.headOption.getOrElse(\"unknown\"), \
         c.lineNumber.getOrElse(-1), c.method.fullName))",
    );
    q
}

/// Double-quoted Scala literal; the value cannot end the literal early
pub fn scala_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_methods_defaults_to_internal() {
        let q = QueryTemplate::ListMethods {
            name_pattern: None,
            file_pattern: None,
            callee_pattern: None,
            include_external: false,
        }
        .render()
        .unwrap();
        assert_eq!(
            q,
            "cpg.method.isExternal(false).map(m => (m.name, m.id, m.fullName, m.signature, \
             m.filename, m.lineNumber.getOrElse(-1), m.isExternal)).dedup"
        );
    }

    #[test]
    fn test_list_methods_with_filters() {
        let q = QueryTemplate::ListMethods {
            name_pattern: Some(".*auth.*".to_string()),
            file_pattern: Some("src/.*\\.c".to_string()),
            callee_pattern: Some("memcpy|free".to_string()),
            include_external: true,
        }
        .render()
        .unwrap();
        assert!(q.starts_with(
            "cpg.method.name(\".*auth.*\").where(_.file.name(\"src/.*\\\\.c\"))\
             .where(_.callOut.name(\"memcpy|free\")).map("
        ));
        assert!(!q.contains("isExternal(false)"));
    }

    #[test]
    fn test_get_method_source() {
        let q = QueryTemplate::GetMethodSource {
            method_name: "main".to_string(),
            filename: Some("app.c".to_string()),
        }
        .render()
        .unwrap();
        assert_eq!(
            q,
            "cpg.method.name(\"main\").filename(\".*app\\\\.c.*\").map(m => (m.name, m.filename, \
             m.lineNumber.getOrElse(-1), m.lineNumberEnd.getOrElse(-1), m.code))"
        );

        let err = QueryTemplate::GetMethodSource {
            method_name: "  ".to_string(),
            filename: None,
        }
        .render()
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn test_list_calls() {
        let q = QueryTemplate::ListCalls {
            caller_pattern: Some("main".to_string()),
            callee_pattern: Some("strcpy".to_string()),
        }
        .render()
        .unwrap();
        assert_eq!(
            q,
            "cpg.call.name(\"strcpy\").where(_.method.name(\"main\")).map(c => (c.method.name, \
             c.name, c.code, c.method.filename, c.lineNumber.getOrElse(-1))).dedup"
        );
    }

    #[test]
    fn test_taint_sources_use_defaults() {
        let q = QueryTemplate::TaintSources {
            patterns: Vec::new(),
            filename: None,
        }
        .render()
        .unwrap();
        assert!(q.starts_with(
            "cpg.call.name(\"getenv|fgets|scanf|read|recv|accept|fopen\").map(c => (c.id,"
        ));
    }

    #[test]
    fn test_taint_sinks_escape_patterns() {
        let q = QueryTemplate::TaintSinks {
            patterns: vec!["system(".to_string(), "Runtime.exec".to_string()],
            filename: Some("cmd.c".to_string()),
        }
        .render()
        .unwrap();
        assert!(q.starts_with(
            "cpg.call.name(\"system|Runtime\\\\.exec\").where(_.file.name(\".*cmd\\\\.c.*\"))"
        ));
        assert!(q.ends_with("c.lineNumber.getOrElse(-1), c.method.fullName))"));
    }

    #[test]
    fn test_quotes_cannot_escape_literal() {
        assert_eq!(scala_string(r#"a"); sys.exit(1); ("#), r#""a\"); sys.exit(1); (""#);
        assert_eq!(scala_string("a\\b"), r#""a\\b""#);
    }
}
