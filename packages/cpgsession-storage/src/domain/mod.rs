//! Domain layer: the durable key-value store port
//!
//! The orchestrator keeps three kinds of records outside process memory:
//!
//! - `session:<id>`: session records (JSON), rewritten on every transition
//! - `artifact:<key>`: artifact cache entry metadata (JSON)
//! - `lease:artifact:<key>`: build leases, taken with `compare_and_swap`
//!
//! # Port Trait
//!
//! - `KeyValueStore`: byte-oriented get/set/delete with TTLs and CAS
//! - `JsonStoreExt`: typed helpers layered on top of any store
//!
//! # Examples
//!
//! ```rust,ignore
//! use cpgsession_storage::{JsonStoreExt, KeyValueStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.set_json("session:abc", &record, None).await?;
//! let loaded: Option<Record> = store.get_json("session:abc").await?;
//!
//! // Take a lease only if nobody holds it
//! let won = store
//!     .compare_and_swap("lease:artifact:k", None, Some(b"owner".to_vec()), Some(ttl))
//!     .await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: KeyValueStore
// ═══════════════════════════════════════════════════════════════════════════

/// Durable key-value store abstraction
///
/// Semantics shared by every adapter:
///
/// - An expired key behaves exactly like a missing key for every operation.
/// - `set` with `ttl = None` stores the value without expiry and clears any
///   previous expiry on that key.
/// - `compare_and_swap` is atomic with respect to all other operations on the
///   same store instance.
///
/// # Implementations
///
/// - `MemoryStore`: process-local, used in tests and single-shot runs
/// - `SqliteStore`: file-backed, survives restarts
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete `key`
    ///
    /// # Returns
    ///
    /// `true` if a live value was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Reset the expiry of an existing key to `now + ttl`
    ///
    /// # Returns
    ///
    /// `false` if the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically replace the value under `key` if it currently equals `expected`
    ///
    /// # Arguments
    ///
    /// - `expected`: `None` means "key must be absent"
    /// - `new`: `None` deletes the key on success
    /// - `ttl`: expiry applied to `new`
    ///
    /// # Returns
    ///
    /// `true` if the swap happened
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// List live keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Physically drop expired keys
    ///
    /// # Returns
    ///
    /// Number of keys removed
    async fn purge_expired(&self) -> Result<usize>;
}

/// Typed JSON helpers for any `KeyValueStore`
#[async_trait]
pub trait JsonStoreExt: KeyValueStore {
    /// Get and deserialize a JSON value
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize and store a JSON value
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }
}

impl<S: KeyValueStore + ?Sized> JsonStoreExt for S {}

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(crate::StorageError::invalid_argument("key must not be empty"));
    }
    Ok(())
}
