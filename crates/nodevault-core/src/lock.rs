use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::path::RepositoryPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An exclusive lock on a repository subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLock {
    pub id: LockId,
    pub path: RepositoryPath,
    /// Holder identifier (process or session, UUID recommended).
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl TreeLock {
    /// The lock covers `path` itself, an ancestor of it or a descendant.
    pub fn conflicts_with(&self, path: &RepositoryPath) -> bool {
        self.path.overlaps(path)
    }
}

/// Result of a guarded lock insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockInsertResult {
    Acquired(TreeLock),
    /// Held locks overlapping the requested path.
    Conflict(Vec<TreeLock>),
}

/// Shared table of tree locks.
///
/// The store is the single source of truth: `try_insert` must check for
/// overlapping locks and insert atomically, across every process that uses
/// the same store.
#[async_trait]
pub trait TreeLockStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file").
    fn lock_type(&self) -> &'static str;

    /// Insert a lock on `path` unless an overlapping lock is held.
    async fn try_insert(
        &self,
        path: &RepositoryPath,
        owner: &str,
    ) -> Result<LockInsertResult, StorageError>;

    /// Remove a lock. Returns `false` if it was not held (already released).
    async fn delete(&self, lock_id: LockId) -> Result<bool, StorageError>;

    /// All currently held locks.
    async fn list(&self) -> Result<Vec<TreeLock>, StorageError>;

    /// Held locks overlapping `path`.
    async fn find_conflicts(&self, path: &RepositoryPath) -> Result<Vec<TreeLock>, StorageError>;

    /// Synchronous `delete`, used when a lock guard is dropped outside of
    /// an async context (panic, cancelled future).
    fn release_now(&self, lock_id: LockId) -> Result<bool, StorageError>;

    /// Whether `release_now` blocks the calling thread (file locks, I/O).
    fn release_blocks(&self) -> bool {
        false
    }
}
