//! Content-addressed cache of generated artifacts
//!
//! Layout on disk:
//!
//! ```text
//! <cache_dir>/<key>/artifact.bin              published, immutable
//! <cache_dir>/<key>/artifact.bin.tmp-<uuid>   in-flight publish
//! ```
//!
//! At most one build runs per key: callers serialize on the key's build lock
//! and on a durable lease (`lease:artifact:<key>`) in the key-value store,
//! then re-check before building. Entry metadata is mirrored to
//! `artifact:<key>`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cpgsession_storage::{JsonStoreExt, KeyValueStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ArtifactConfig;
use crate::error::{OrchestratorError, Result};
use crate::keyed_lock::KeyedLock;
use crate::session::{Language, SourceDescriptor, SourceKind};

pub const ARTIFACT_FILE: &str = "artifact.bin";
const LEASE_POLL: Duration = Duration::from_millis(250);

// ═══════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════

/// Stable identity of a source, independent of how the caller spelled it
pub fn canonical_identity(source: &SourceDescriptor) -> String {
    match source.kind {
        SourceKind::Local => canonical_local(&source.location),
        SourceKind::Remote => {
            let url = canonical_remote(&source.location);
            match &source.branch {
                Some(branch) if !branch.is_empty() => format!("{}#{}", url, branch),
                _ => url,
            }
        }
    }
}

fn canonical_local(path: &str) -> String {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved.display().to_string(),
        Err(_) => {
            let trimmed = path.trim_end_matches('/');
            if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            }
        }
    }
}

fn canonical_remote(url: &str) -> String {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, url),
    };

    let (authority, path) = match scheme {
        Some(_) => rest.split_once('/').unwrap_or((rest, "")),
        // scp-like: git@host:org/repo
        None => rest.split_once(':').unwrap_or((rest, "")),
    };
    // userinfo carries credentials, never identity
    let host = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host)
        .to_ascii_lowercase();

    let mut path = path.trim_end_matches('/');
    while let Some(stripped) = path.strip_suffix(".git") {
        path = stripped.trim_end_matches('/');
    }

    match scheme {
        Some(scheme) => format!("{}://{}/{}", scheme, host, path),
        None => format!("{}:{}", host, path),
    }
}

/// SHA-256 hex over (identity, language, sorted + deduplicated exclusions)
pub fn artifact_key(source: &SourceDescriptor, exclusion_patterns: &[String]) -> String {
    key_for(&canonical_identity(source), source.language, exclusion_patterns)
}

pub fn key_for(identity: &str, language: Language, exclusion_patterns: &[String]) -> String {
    let mut exclusions: Vec<&str> = exclusion_patterns.iter().map(String::as_str).collect();
    exclusions.sort_unstable();
    exclusions.dedup();

    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update([0u8]);
    hasher.update(language.as_str().as_bytes());
    for pattern in exclusions {
        hasher.update([0u8]);
        hasher.update(pattern.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════════
// Entries
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Building,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCacheEntry {
    pub key: String,
    pub location: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// This call ran the build
    pub built: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    /// READY entries over the ceiling that were skipped because a build held their lock
    pub skipped_locked: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════

pub struct ArtifactCache {
    config: ArtifactConfig,
    entries: DashMap<String, ArtifactCacheEntry>,
    build_locks: KeyedLock,
    store: Arc<dyn KeyValueStore>,
    owner_id: String,
}

impl ArtifactCache {
    pub fn new(config: ArtifactConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            build_locks: KeyedLock::new(),
            store,
            owner_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    pub fn build_timeout(&self) -> Duration {
        self.config.build_timeout()
    }

    fn artifact_path(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(key).join(ARTIFACT_FILE)
    }

    fn meta_key(key: &str) -> String {
        format!("artifact:{}", key)
    }

    fn lease_key(key: &str) -> String {
        format!("lease:artifact:{}", key)
    }

    pub fn get(&self, key: &str) -> Option<ArtifactCacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn entries(&self) -> Vec<ArtifactCacheEntry> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    /// Bytes held by READY entries
    pub fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.status == ArtifactStatus::Ready)
            .map(|e| e.size_bytes)
            .sum()
    }

    async fn mirror(&self, entry: &ArtifactCacheEntry) {
        if let Err(e) = self
            .store
            .set_json(&Self::meta_key(&entry.key), entry, None)
            .await
        {
            warn!(key = %entry.key, error = %e, "failed to mirror artifact metadata");
        }
    }

    /// READY entry whose file is still on disk; bumps lastUsedAt
    ///
    /// No map guard is held across the filesystem check.
    async fn hit(&self, key: &str) -> Option<ArtifactLocation> {
        let location = self
            .entries
            .get(key)
            .filter(|entry| entry.status == ArtifactStatus::Ready)
            .map(|entry| entry.location.clone())?;

        let on_disk = tokio::fs::metadata(&location)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !on_disk {
            warn!(key, "READY artifact missing on disk, dropping entry");
            self.entries.remove_if(key, |_, entry| {
                entry.status == ArtifactStatus::Ready && entry.location == location
            });
            return None;
        }

        let snapshot = {
            let mut entry = self.entries.get_mut(key)?;
            if entry.status != ArtifactStatus::Ready {
                return None;
            }
            entry.last_used_at = Utc::now();
            entry.clone()
        };
        self.mirror(&snapshot).await;
        Some(ArtifactLocation {
            key: key.to_string(),
            path: snapshot.location,
            size_bytes: snapshot.size_bytes,
            built: false,
        })
    }

    /// Adopt an artifact published by another owner of the lease
    async fn adopt_published(&self, key: &str) -> Option<ArtifactLocation> {
        let path = self.artifact_path(key);
        let size = tokio::fs::metadata(&path).await.ok()?.len();
        let now = Utc::now();
        let entry = ArtifactCacheEntry {
            key: key.to_string(),
            location: path.clone(),
            size_bytes: size,
            created_at: now,
            last_used_at: now,
            status: ArtifactStatus::Ready,
            last_error: None,
        };
        self.entries.insert(key.to_string(), entry.clone());
        self.mirror(&entry).await;
        Some(ArtifactLocation {
            key: key.to_string(),
            path,
            size_bytes: size,
            built: false,
        })
    }

    /// Take the durable lease, or adopt a build someone else finished
    async fn acquire_lease(&self, key: &str, deadline: tokio::time::Instant) -> Result<Option<ArtifactLocation>> {
        let lease = Self::lease_key(key);
        loop {
            let won = self
                .store
                .compare_and_swap(
                    &lease,
                    None,
                    Some(self.owner_id.as_bytes().to_vec()),
                    Some(self.config.build_timeout()),
                )
                .await?;
            if won {
                return Ok(None);
            }
            if let Some(location) = self.adopt_published(key).await {
                return Ok(Some(location));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::BuildTimeout(format!(
                    "artifact {} is being built elsewhere",
                    key
                )));
            }
            debug!(key, "build lease held elsewhere, waiting");
            tokio::time::sleep(LEASE_POLL).await;
        }
    }

    async fn release_lease(&self, key: &str) {
        let lease = Self::lease_key(key);
        if let Err(e) = self
            .store
            .compare_and_swap(&lease, Some(self.owner_id.as_bytes()), None, None)
            .await
        {
            warn!(key, error = %e, "failed to release build lease");
        }
    }

    /// Return the artifact for (source, exclusions), building it at most once
    ///
    /// `build` receives the cache key and must return the path of the file it
    /// produced; the cache moves it into place.
    pub async fn resolve_or_build<F, Fut>(
        &self,
        source: &SourceDescriptor,
        exclusion_patterns: &[String],
        build: F,
    ) -> Result<ArtifactLocation>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = Result<PathBuf>> + Send,
    {
        let key = artifact_key(source, exclusion_patterns);
        if let Some(location) = self.hit(&key).await {
            debug!(key = %key, "artifact cache hit");
            return Ok(location);
        }

        let timeout = self.config.build_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let _guard = self
            .build_locks
            .lock_timeout(&key, timeout)
            .await
            .ok_or_else(|| {
                OrchestratorError::BuildTimeout(format!(
                    "waited {}s for concurrent build of {}",
                    timeout.as_secs(),
                    key
                ))
            })?;

        // Whoever held the lock before us may have published it
        if let Some(location) = self.hit(&key).await {
            return Ok(location);
        }
        if let Some(location) = self.acquire_lease(&key, deadline).await? {
            return Ok(location);
        }

        let result = self.build_locked(&key, timeout, build).await;
        self.release_lease(&key).await;
        result
    }

    async fn build_locked<F, Fut>(&self, key: &str, timeout: Duration, build: F) -> Result<ArtifactLocation>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = Result<PathBuf>> + Send,
    {
        let now = Utc::now();
        let mut entry = ArtifactCacheEntry {
            key: key.to_string(),
            location: self.artifact_path(key),
            size_bytes: 0,
            created_at: now,
            last_used_at: now,
            status: ArtifactStatus::Building,
            last_error: None,
        };
        self.entries.insert(key.to_string(), entry.clone());
        self.mirror(&entry).await;
        info!(key, timeout_s = timeout.as_secs(), "building artifact");

        let outcome = match tokio::time::timeout(timeout, build(key.to_string())).await {
            Err(_) => Err(OrchestratorError::BuildTimeout(format!(
                "artifact build exceeded {}s",
                timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(match e {
                OrchestratorError::Build(_) | OrchestratorError::BuildTimeout(_) => e,
                other => OrchestratorError::Build(other.message()),
            }),
            Ok(Ok(produced)) => self.publish(key, &produced).await,
        };

        match outcome {
            Ok(size) => {
                entry.status = ArtifactStatus::Ready;
                entry.size_bytes = size;
                entry.last_used_at = Utc::now();
                self.entries.insert(key.to_string(), entry.clone());
                self.mirror(&entry).await;
                info!(key, size_bytes = size, "artifact published");
                Ok(ArtifactLocation {
                    key: key.to_string(),
                    path: entry.location,
                    size_bytes: size,
                    built: true,
                })
            }
            Err(e) => {
                entry.status = ArtifactStatus::Failed;
                entry.last_error = Some(e.message());
                self.entries.insert(key.to_string(), entry.clone());
                self.mirror(&entry).await;
                warn!(key, error = %e, "artifact build failed");
                Err(e)
            }
        }
    }

    /// Move `produced` to its final path via tmp + rename
    async fn publish(&self, key: &str, produced: &Path) -> Result<u64> {
        let size = match tokio::fs::metadata(produced).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(OrchestratorError::Build(format!(
                    "engine produced no artifact at {}",
                    produced.display()
                )))
            }
        };
        if size < self.config.min_artifact_bytes {
            return Err(OrchestratorError::Build(format!(
                "artifact is {} bytes, expected at least {}",
                size, self.config.min_artifact_bytes
            )));
        }

        let dir = self.config.cache_dir.join(key);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.tmp-{}", ARTIFACT_FILE, Uuid::new_v4()));
        if tokio::fs::rename(produced, &tmp).await.is_err() {
            // Different filesystem
            tokio::fs::copy(produced, &tmp).await?;
            let _ = tokio::fs::remove_file(produced).await;
        }
        if let Err(e) = tokio::fs::rename(&tmp, dir.join(ARTIFACT_FILE)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(size)
    }

    /// LRU-evict READY entries until the total is at most `max_total_bytes`
    pub async fn evict(&self, max_total_bytes: u64) -> EvictionReport {
        let mut candidates: Vec<ArtifactCacheEntry> = self
            .entries
            .iter()
            .filter(|e| e.status == ArtifactStatus::Ready)
            .map(|e| e.value().clone())
            .collect();
        candidates.sort_by(|a, b| a.last_used_at.cmp(&b.last_used_at));

        let mut report = EvictionReport {
            remaining_bytes: candidates.iter().map(|e| e.size_bytes).sum(),
            ..EvictionReport::default()
        };

        for candidate in candidates {
            if report.remaining_bytes <= max_total_bytes {
                break;
            }
            // try_lock keeps a build from starting on this key while we delete
            let Some(_guard) = self.build_locks.try_lock(&candidate.key) else {
                report.skipped_locked += 1;
                continue;
            };
            let removed = self
                .entries
                .remove_if(&candidate.key, |_, e| e.status == ArtifactStatus::Ready);
            if removed.is_none() {
                continue;
            }

            if let Some(dir) = candidate.location.parent() {
                if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                    warn!(key = %candidate.key, error = %e, "failed to delete evicted artifact");
                }
            }
            if let Err(e) = self.store.delete(&Self::meta_key(&candidate.key)).await {
                warn!(key = %candidate.key, error = %e, "failed to delete artifact metadata");
            }
            report.remaining_bytes = report.remaining_bytes.saturating_sub(candidate.size_bytes);
            report.freed_bytes += candidate.size_bytes;
            info!(key = %candidate.key, size_bytes = candidate.size_bytes, "artifact evicted");
            report.evicted.push(candidate.key);
        }
        self.build_locks.prune();
        report
    }

    /// Re-index published artifacts found on disk as READY
    ///
    /// Leftover tmp files from interrupted publishes are deleted.
    pub async fn load_existing(&self) -> Result<usize> {
        let mut dirs = match tokio::fs::read_dir(&self.config.cache_dir).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = 0;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let key = dir.file_name().to_string_lossy().into_owned();

            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.starts_with(&format!("{}.tmp-", ARTIFACT_FILE)) {
                    let _ = tokio::fs::remove_file(file.path()).await;
                }
            }

            let path = dir.path().join(ARTIFACT_FILE);
            let Ok(meta) = tokio::fs::metadata(&path).await else {
                continue;
            };
            let stored: Option<ArtifactCacheEntry> = self
                .store
                .get_json(&Self::meta_key(&key))
                .await
                .unwrap_or(None);
            let now = Utc::now();
            let entry = ArtifactCacheEntry {
                key: key.clone(),
                location: path,
                size_bytes: meta.len(),
                created_at: stored.as_ref().map_or(now, |s| s.created_at),
                last_used_at: stored.as_ref().map_or(now, |s| s.last_used_at),
                status: ArtifactStatus::Ready,
                last_error: None,
            };
            self.mirror(&entry).await;
            self.entries.insert(key, entry);
            loaded += 1;
        }
        info!(loaded, dir = %self.config.cache_dir.display(), "artifact cache re-indexed");
        Ok(loaded)
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&self, key: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.last_used_at = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpgsession_storage::MemoryStore;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(dir: &Path, min_bytes: u64, timeout_s: u64) -> ArtifactCache {
        let config = ArtifactConfig {
            cache_dir: dir.join("cache"),
            build_timeout_seconds: timeout_s,
            min_artifact_bytes: min_bytes,
            max_total_size_bytes: u64::MAX,
        };
        ArtifactCache::new(config, Arc::new(MemoryStore::new()))
    }

    async fn write_artifact(dir: &Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, vec![7u8; len]).await.unwrap();
        path
    }

    #[test]
    fn test_remote_identity_normalization() {
        let a = SourceDescriptor::remote("HTTPS://GitHub.com/Org/Repo.git/", Language::Java);
        let b = SourceDescriptor::remote("https://github.com/Org/Repo", Language::Java);
        assert_eq!(canonical_identity(&a), "https://github.com/Org/Repo");
        assert_eq!(canonical_identity(&a), canonical_identity(&b));

        let branch = b.clone().with_branch("dev");
        assert_eq!(canonical_identity(&branch), "https://github.com/Org/Repo#dev");
    }

    #[test]
    fn test_remote_identity_ignores_userinfo() {
        let with_token = SourceDescriptor::remote("https://tok@github.com/o/r", Language::Go);
        let plain = SourceDescriptor::remote("https://github.com/o/r", Language::Go);
        assert_eq!(canonical_identity(&with_token), canonical_identity(&plain));
    }

    #[test]
    fn test_local_identity_fallback() {
        let s = SourceDescriptor::local("/no/such/dir///", Language::C);
        assert_eq!(canonical_identity(&s), "/no/such/dir");
    }

    #[test]
    fn test_language_changes_key() {
        let java = SourceDescriptor::local("/src", Language::Java);
        let kotlin = SourceDescriptor::local("/src", Language::Kotlin);
        assert_ne!(artifact_key(&java, &[]), artifact_key(&kotlin, &[]));
    }

    proptest! {
        #[test]
        fn prop_exclusion_order_and_duplicates_do_not_matter(
            patterns in proptest::collection::vec("[a-z./*]{1,8}", 0..6),
            seed in any::<u64>(),
        ) {
            let mut shuffled = patterns.clone();
            // deterministic rotate + duplicate first element
            if !shuffled.is_empty() {
                let len = shuffled.len();
                shuffled.rotate_left((seed as usize) % len);
                shuffled.push(shuffled[0].clone());
            }
            prop_assert_eq!(
                key_for("/src", Language::Java, &patterns),
                key_for("/src", Language::Java, &shuffled)
            );
        }

        #[test]
        fn prop_trailing_slash_and_git_suffix_ignored(
            host in "[a-z]{3,10}\\.com",
            path in "[a-z]{1,8}/[a-z]{1,8}",
            slashes in 0usize..3,
        ) {
            let base = format!("https://{}/{}", host, path);
            let decorated = format!("https://{}/{}.git{}", host.to_uppercase(), path, "/".repeat(slashes));
            prop_assert_eq!(canonical_remote(&base), canonical_remote(&decorated));
        }
    }

    #[tokio::test]
    async fn test_build_exactly_once_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(dir.path(), 16, 10));
        let builds = Arc::new(AtomicUsize::new(0));
        let source = SourceDescriptor::local("/src/app", Language::Java);

        let mut handles = Vec::new();
        for i in 0..6 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            let source = source.clone();
            let scratch = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                cache
                    .resolve_or_build(&source, &[], move |_key| async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(write_artifact(&scratch, &format!("out-{}", i), 64).await)
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap().path);
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(tokio::fs::metadata(&paths[0]).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_artifact_deleted_on_disk_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 16, 10);
        let builds = AtomicUsize::new(0);
        let source = SourceDescriptor::local("/src/app", Language::Go);
        let build = |name: &'static str| {
            let scratch = dir.path().to_path_buf();
            let builds = &builds;
            move |_key: String| async move {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok::<_, OrchestratorError>(write_artifact(&scratch, name, 64).await)
            }
        };

        let first = cache.resolve_or_build(&source, &[], build("a")).await.unwrap();
        let cached = cache.resolve_or_build(&source, &[], build("b")).await.unwrap();
        assert!(!cached.built);
        tokio::fs::remove_file(&first.path).await.unwrap();

        let rebuilt = cache.resolve_or_build(&source, &[], build("c")).await.unwrap();

        assert!(rebuilt.built);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(cache.get(&rebuilt.key).is_some());
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 16, 10);
        let source = SourceDescriptor::local("/src/app", Language::Java);

        let err = cache
            .resolve_or_build(&source, &[], |_| async {
                Err(OrchestratorError::internal("frontend crashed"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BuildError);
        let key = artifact_key(&source, &[]);
        assert_eq!(cache.get(&key).unwrap().status, ArtifactStatus::Failed);

        let scratch = dir.path().to_path_buf();
        let location = cache
            .resolve_or_build(&source, &[], |_| async move {
                Ok(write_artifact(&scratch, "ok", 32).await)
            })
            .await
            .unwrap();
        assert!(location.built);
        assert_eq!(cache.get(&key).unwrap().status, ArtifactStatus::Ready);
    }

    #[tokio::test]
    async fn test_build_timeout_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 16, 1);
        let source = SourceDescriptor::local("/src/slow", Language::Python);

        let err = cache
            .resolve_or_build(&source, &[], |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(PathBuf::from("/never"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::BuildTimeout);
        let entry = cache.get(&artifact_key(&source, &[])).unwrap();
        assert_eq!(entry.status, ArtifactStatus::Failed);
    }

    #[tokio::test]
    async fn test_tiny_artifact_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024, 10);
        let source = SourceDescriptor::local("/src/tiny", Language::Go);
        let scratch = dir.path().to_path_buf();

        let err = cache
            .resolve_or_build(&source, &[], |_| async move {
                Ok(write_artifact(&scratch, "tiny", 10).await)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BuildError);
    }

    #[tokio::test]
    async fn test_evict_lru_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1, 10);
        let base = Utc::now();

        let mut keys = Vec::new();
        for (i, name) in ["old", "mid", "new"].iter().enumerate() {
            let source = SourceDescriptor::local(format!("/src/{}", name), Language::Java);
            let scratch = dir.path().to_path_buf();
            let name = name.to_string();
            let loc = cache
                .resolve_or_build(&source, &[], |_| async move {
                    Ok(write_artifact(&scratch, &name, 100).await)
                })
                .await
                .unwrap();
            cache.set_last_used(&loc.key, base + chrono::Duration::seconds(i as i64));
            keys.push(loc.key);
        }
        assert_eq!(cache.total_size(), 300);

        let report = cache.evict(150).await;
        assert_eq!(report.evicted, vec![keys[0].clone(), keys[1].clone()]);
        assert_eq!(report.freed_bytes, 200);
        assert_eq!(cache.total_size(), 100);
        assert!(cache.get(&keys[2]).is_some());
        assert!(!dir.path().join("cache").join(&keys[0]).exists());
    }

    #[tokio::test]
    async fn test_evict_skips_locked_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1, 10);
        let source = SourceDescriptor::local("/src/busy", Language::Java);
        let scratch = dir.path().to_path_buf();
        let loc = cache
            .resolve_or_build(&source, &[], |_| async move {
                Ok(write_artifact(&scratch, "busy", 100).await)
            })
            .await
            .unwrap();

        let _held = cache.build_locks.lock(&loc.key).await;
        let report = cache.evict(0).await;

        assert!(report.evicted.is_empty());
        assert_eq!(report.skipped_locked, 1);
        assert!(cache.get(&loc.key).is_some());
    }

    #[tokio::test]
    async fn test_load_existing_reindexes_and_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("cache").join("abc");
        tokio::fs::create_dir_all(&key_dir).await.unwrap();
        tokio::fs::write(key_dir.join(ARTIFACT_FILE), vec![1u8; 50]).await.unwrap();
        tokio::fs::write(key_dir.join("artifact.bin.tmp-123"), b"partial").await.unwrap();

        let cache = cache(dir.path(), 1, 10);
        assert_eq!(cache.load_existing().await.unwrap(), 1);

        let entry = cache.get("abc").unwrap();
        assert_eq!(entry.status, ArtifactStatus::Ready);
        assert_eq!(entry.size_bytes, 50);
        assert!(!key_dir.join("artifact.bin.tmp-123").exists());
    }
}
