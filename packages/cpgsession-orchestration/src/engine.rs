//! Analysis engine driver
//!
//! The engine itself is opaque. This trait only describes which commands to
//! run inside an environment and what script text to feed them. All paths
//! passed in are guest paths (what the engine sees).

use std::path::{Path, PathBuf};

use crate::session::Language;

pub trait AnalysisEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// argv that generates the artifact for `source_dir` into `output`
    fn frontend_command(
        &self,
        language: Language,
        source_dir: &Path,
        output: &Path,
        exclusion_patterns: &[String],
    ) -> Vec<String>;

    /// Script text that evaluates `query`, skipping `offset` rows and
    /// keeping at most `limit`, and writes JSON to `output`
    fn render_script(&self, query: &str, limit: usize, offset: usize, output: &Path) -> String;

    /// argv that loads `artifact` and runs `script` in a fresh process
    fn direct_query_command(&self, artifact: &Path, script: &Path) -> Vec<String>;

    /// argv for a long-lived interactive process with `artifact` loaded
    fn repl_command(&self, artifact: &Path) -> Vec<String>;

    /// Text written to the interactive process's stdin to run `script`
    ///
    /// Must make the process print `marker` on its own line once the script
    /// has finished (successfully or not).
    fn repl_invocation(&self, script: &Path, marker: &str) -> String;
}

/// Single-quote for POSIX sh
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ═══════════════════════════════════════════════════════════════════════════
// Joern
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct JoernEngine {
    home: PathBuf,
}

impl JoernEngine {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn frontend_binary(language: Language) -> &'static str {
        match language {
            Language::Java => "javasrc2cpg",
            Language::C | Language::Cpp => "c2cpg.sh",
            Language::Javascript => "jssrc2cpg.sh",
            Language::Python => "pysrc2cpg",
            Language::Go => "gosrc2cpg",
            Language::Kotlin => "kotlin2cpg",
            Language::Csharp => "csharpsrc2cpg",
            Language::Ghidra => "ghidra2cpg",
            Language::Jimple => "jimple2cpg",
            Language::Php => "php2cpg",
            Language::Ruby => "rubysrc2cpg",
            Language::Swift => "swiftsrc2cpg.sh",
        }
    }

    fn joern(&self) -> String {
        self.home.join("joern").display().to_string()
    }

    /// Force JSON output with the requested row window
    ///
    /// Single-line queries lose one trailing `.l` / `.toList` / `.toJson`
    /// and every `.take(n)` / `.drop(n)`, then get
    /// `.drop(offset).take(limit).toJsonPretty` (no `.drop` for offset 0).
    /// Multi-line, `val`, conditional and already-pretty queries are kept.
    pub fn normalize_query(query: &str, limit: usize, offset: usize) -> String {
        let query = query.trim();
        if query.ends_with(".toJsonPretty")
            || query.contains('\n')
            || query.starts_with("val ")
            || query.contains("if (")
        {
            return query.to_string();
        }

        let mut q = query;
        for suffix in [".l", ".toList", ".toJson"] {
            if let Some(stripped) = q.strip_suffix(suffix) {
                q = stripped;
                break;
            }
        }

        let q = strip_call(q, ".take(");
        let mut q = strip_call(&q, ".drop(");
        if offset > 0 {
            q = format!("{}.drop({})", q, offset);
        }
        format!("{}.take({}).toJsonPretty", q, limit)
    }
}

/// Remove every `<prefix><digits>)` occurrence
fn strip_call(query: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut rest = query;
    while let Some(pos) = rest.find(prefix) {
        let after = &rest[pos + prefix.len()..];
        let digits = after.chars().take_while(char::is_ascii_digit).count();
        if digits > 0 && after[digits..].starts_with(')') {
            out.push_str(&rest[..pos]);
            rest = &after[digits + 1..];
        } else {
            out.push_str(&rest[..pos + prefix.len()]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

impl AnalysisEngine for JoernEngine {
    fn name(&self) -> &'static str {
        "joern"
    }

    fn frontend_command(
        &self,
        language: Language,
        source_dir: &Path,
        output: &Path,
        exclusion_patterns: &[String],
    ) -> Vec<String> {
        let mut argv = vec![
            self.home
                .join(Self::frontend_binary(language))
                .display()
                .to_string(),
            source_dir.display().to_string(),
            "-o".to_string(),
            output.display().to_string(),
        ];
        if !exclusion_patterns.is_empty() {
            let combined = exclusion_patterns
                .iter()
                .map(|p| format!("({})", p))
                .collect::<Vec<_>>()
                .join("|");
            argv.push("--exclude-regex".to_string());
            argv.push(combined);
        }
        argv
    }

    fn render_script(&self, query: &str, limit: usize, offset: usize, output: &Path) -> String {
        format!(
            "{} #> \"{}\"\n",
            Self::normalize_query(query, limit, offset),
            output.display()
        )
    }

    fn direct_query_command(&self, artifact: &Path, script: &Path) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "{} {} < {}",
                shell_quote(&self.joern()),
                shell_quote(&artifact.display().to_string()),
                shell_quote(&script.display().to_string())
            ),
        ]
    }

    fn repl_command(&self, artifact: &Path) -> Vec<String> {
        vec![self.joern(), artifact.display().to_string()]
    }

    fn repl_invocation(&self, script: &Path, marker: &str) -> String {
        format!(":load {}\nprintln(\"{}\")\n", script.display(), marker)
    }
}
