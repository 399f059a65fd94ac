use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use nodevault_core::{LockId, LockInsertResult, RepositoryPath, StorageError, TreeLock, TreeLockStore};
use tracing::{debug, instrument};

#[derive(Debug, Default)]
struct LockTable {
    next_id: u64,
    locks: BTreeMap<LockId, TreeLock>,
}

impl LockTable {
    fn conflicts(&self, path: &RepositoryPath) -> Vec<TreeLock> {
        self.locks
            .values()
            .filter(|lock| lock.conflicts_with(path))
            .cloned()
            .collect()
    }
}

/// Process-local tree lock table.
#[derive(Debug, Default)]
pub struct MemoryTreeLockStore {
    table: Mutex<LockTable>,
}

impl MemoryTreeLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, lock_id: LockId) -> bool {
        let removed = self.table().locks.remove(&lock_id);
        match &removed {
            Some(lock) => debug!("Released tree lock {} on {}", lock_id, lock.path),
            None => debug!("Tree lock {} not held", lock_id),
        }
        removed.is_some()
    }
}

#[async_trait]
impl TreeLockStore for MemoryTreeLockStore {
    fn lock_type(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_insert(&self, path: &RepositoryPath, owner: &str) -> Result<LockInsertResult, StorageError> {
        let mut table = self.table();
        let conflicts = table.conflicts(path);
        if !conflicts.is_empty() {
            debug!("Tree lock on {} refused: {} overlapping lock(s)", path, conflicts.len());
            return Ok(LockInsertResult::Conflict(conflicts));
        }

        table.next_id += 1;
        let lock = TreeLock {
            id: LockId(table.next_id),
            path: path.clone(),
            owner: owner.to_string(),
            acquired_at: Utc::now(),
        };
        table.locks.insert(lock.id, lock.clone());
        debug!("Acquired tree lock {} on {} for {}", lock.id, path, owner);
        Ok(LockInsertResult::Acquired(lock))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, lock_id: LockId) -> Result<bool, StorageError> {
        Ok(self.remove(lock_id))
    }

    async fn list(&self) -> Result<Vec<TreeLock>, StorageError> {
        Ok(self.table().locks.values().cloned().collect())
    }

    async fn find_conflicts(&self, path: &RepositoryPath) -> Result<Vec<TreeLock>, StorageError> {
        Ok(self.table().conflicts(path))
    }

    fn release_now(&self, lock_id: LockId) -> Result<bool, StorageError> {
        Ok(self.remove(lock_id))
    }
}
