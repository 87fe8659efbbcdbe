//! Durable key-value storage for cpgsession
//!
//! The orchestrator persists session records, artifact cache metadata and
//! build leases through a single narrow port so that process restarts do not
//! lose track of what lives on disk.
//!
//! ## Core Principles
//!
//! 1. **Bytes In, Bytes Out**: the port stores opaque values; JSON is a helper
//! 2. **Expiry Is Absence**: an expired key is indistinguishable from a missing one
//! 3. **CAS For Ownership**: leases are taken with `compare_and_swap`, never get-then-set
//!
//! ## Adapters
//!
//! - `MemoryStore`: process-local map, always available
//! - `SqliteStore`: single-file database (feature `sqlite`, on by default)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cpgsession_storage::{JsonStoreExt, KeyValueStore, SqliteStore};
//!
//! let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open("state.db")?);
//! store.set_json("session:abc", &record, None).await?;
//!
//! for key in store.keys("session:").await? {
//!     let record: Option<Record> = store.get_json(&key).await?;
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{JsonStoreExt, KeyValueStore};
pub use infrastructure::MemoryStore;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteStore;
