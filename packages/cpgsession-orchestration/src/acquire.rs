//! Source acquisition: local copy or shallow git clone into a workspace

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::environment::run_with_timeout;
use crate::error::OrchestratorError;
use crate::session::{SourceDescriptor, SourceKind};

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("source not found: {0}")]
    NotFound(String),

    #[error("source is {size} bytes, limit is {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("source acquisition failed: {0}")]
    Failed(String),
}

impl From<AcquireError> for OrchestratorError {
    fn from(err: AcquireError) -> Self {
        OrchestratorError::Provisioning(err.to_string())
    }
}

impl From<std::io::Error> for AcquireError {
    fn from(err: std::io::Error) -> Self {
        AcquireError::Failed(err.to_string())
    }
}

#[async_trait]
pub trait SourceAcquirer: Send + Sync {
    /// Materialize `source` under `dest` and return the source root
    async fn acquire(&self, source: &SourceDescriptor, dest: &Path) -> Result<PathBuf, AcquireError>;
}

#[derive(Debug, Clone)]
pub struct DefaultSourceAcquirer {
    max_bytes: u64,
    git_binary: String,
    clone_timeout: Duration,
}

impl DefaultSourceAcquirer {
    pub fn new(max_bytes: u64, clone_timeout: Duration) -> Self {
        Self {
            max_bytes,
            git_binary: "git".to_string(),
            clone_timeout,
        }
    }

    /// Run `binary` instead of `git` from `PATH`
    pub fn with_git_binary(mut self, binary: impl Into<String>) -> Self {
        self.git_binary = binary.into();
        self
    }

    async fn copy_local(&self, source: &Path, dest: &Path) -> Result<PathBuf, AcquireError> {
        if !source.is_absolute() {
            return Err(AcquireError::Failed(format!(
                "local path must be absolute: {}",
                source.display()
            )));
        }
        if !source.is_dir() {
            return Err(AcquireError::NotFound(source.display().to_string()));
        }

        let (source, dest, limit) = (source.to_path_buf(), dest.to_path_buf(), self.max_bytes);
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest, limit))
            .await
            .map_err(|e| AcquireError::Failed(format!("copy task failed: {}", e)))?
    }

    async fn clone_remote(&self, source: &SourceDescriptor, dest: &Path) -> Result<PathBuf, AcquireError> {
        let mut command = Command::new(&self.git_binary);
        command.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = &source.branch {
            command.arg("--branch").arg(branch);
        }
        command
            .arg(&source.location)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0");
        // Config from the environment applies to this run only and never
        // reaches the clone's .git/config
        let header = source
            .credential
            .as_ref()
            .filter(|_| source.location.starts_with("https://"))
            .map(|credential| auth_header(credential.expose()));
        if let Some(header) = &header {
            command
                .env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", header);
        }

        info!(url = %source.location, branch = ?source.branch, "cloning repository");
        let out = run_with_timeout(command, self.clone_timeout)
            .await
            .map_err(|e| AcquireError::Failed(e.message()))?;

        if out.timed_out {
            return Err(AcquireError::Failed(format!(
                "git clone did not finish within {}s",
                self.clone_timeout.as_secs()
            )));
        }
        if !out.success() {
            let mut stderr = out.stderr.clone();
            if let Some(credential) = &source.credential {
                stderr = stderr.replace(credential.expose(), "***");
            }
            if let Some(header) = &header {
                stderr = stderr.replace(header.as_str(), "Authorization: ***");
            }
            return Err(classify_git_failure(&source.location, &stderr));
        }

        let size = tokio::task::spawn_blocking({
            let dest = dest.to_path_buf();
            move || tree_size(&dest)
        })
        .await
        .map_err(|e| AcquireError::Failed(format!("size check failed: {}", e)))?;
        if size > self.max_bytes {
            let _ = tokio::fs::remove_dir_all(dest).await;
            return Err(AcquireError::SizeExceeded {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl SourceAcquirer for DefaultSourceAcquirer {
    async fn acquire(&self, source: &SourceDescriptor, dest: &Path) -> Result<PathBuf, AcquireError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match source.kind {
            SourceKind::Local => self.copy_local(Path::new(&source.location), dest).await,
            SourceKind::Remote => self.clone_remote(source, dest).await,
        }
    }
}

/// Basic auth header accepted by GitHub, GitLab and Bitbucket for tokens
pub fn auth_header(token: &str) -> String {
    let encoded = BASE64.encode(format!("x-access-token:{}", token));
    format!("Authorization: Basic {}", encoded)
}

fn classify_git_failure(location: &str, stderr: &str) -> AcquireError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("authentication failed")
        || lowered.contains("could not read username")
        || lowered.contains("permission denied")
    {
        AcquireError::AuthRequired(location.to_string())
    } else if lowered.contains("not found") || lowered.contains("does not exist") {
        AcquireError::NotFound(location.to_string())
    } else {
        let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        AcquireError::Failed(format!("git clone failed: {}", last.trim()))
    }
}

fn tree_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn copy_tree(source: &Path, dest: &Path, limit: u64) -> Result<PathBuf, AcquireError> {
    let mut copied: u64 = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| AcquireError::Failed(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| AcquireError::Failed(e.to_string()))?;
        let target = dest.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            copied += len;
            if copied > limit {
                let _ = std::fs::remove_dir_all(dest);
                return Err(AcquireError::SizeExceeded {
                    size: copied,
                    limit,
                });
            }
            std::fs::copy(entry.path(), &target)?;
        }
        // symlinks are skipped so a source cannot point outside itself
    }
    debug!(bytes = copied, dest = %dest.display(), "local source copied");
    Ok(dest.to_path_buf())
}
