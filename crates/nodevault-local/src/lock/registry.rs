//! Tree lock registry.
//!
//! Front end over a [`TreeLockStore`]: turns conflicts into
//! [`RepositoryError::LockedTree`], hands out guards that always release,
//! and announces lock changes on the cluster channel. The store stays the
//! single source of truth; the registry keeps no lock state of its own.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use nodevault_core::{
    ClusterChannel, ClusterMessage, LockId, LockInsertResult, RepositoryError, RepositoryPath,
    RepositoryResult, StorageError, TreeLock, TreeLockStore,
};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::cancel::CancellationSignal;

fn publish(cluster: &Option<Arc<dyn ClusterChannel>>, message: ClusterMessage) {
    if let Some(cluster) = cluster {
        if let Err(e) = cluster.publish(message) {
            warn!("Failed to publish cluster message: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct TreeLockRegistry {
    store: Arc<dyn TreeLockStore>,
    cluster: Option<Arc<dyn ClusterChannel>>,
    owner: String,
}

impl TreeLockRegistry {
    pub fn new(store: Arc<dyn TreeLockStore>, owner: impl Into<String>) -> Self {
        Self {
            store,
            cluster: None,
            owner: owner.into(),
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterChannel>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn TreeLockStore> {
        &self.store
    }

    /// Lock one subtree.
    pub async fn acquire(&self, path: &RepositoryPath) -> RepositoryResult<TreeLockGuard> {
        self.acquire_all(std::slice::from_ref(path)).await
    }

    /// Lock several subtrees, all or nothing.
    ///
    /// Paths nested inside another requested path are covered by it and are
    /// not locked separately.
    pub async fn acquire_all(&self, paths: &[RepositoryPath]) -> RepositoryResult<TreeLockGuard> {
        let mut guard = TreeLockGuard {
            store: self.store.clone(),
            cluster: self.cluster.clone(),
            locks: Vec::new(),
        };

        for path in covering_paths(paths) {
            let result = match self.store.try_insert(&path, &self.owner).await {
                Ok(result) => result,
                Err(e) => {
                    guard.release_quietly().await;
                    return Err(e.into());
                }
            };
            match result {
                LockInsertResult::Acquired(lock) => {
                    publish(
                        &self.cluster,
                        ClusterMessage::LockAcquired {
                            lock_id: lock.id,
                            path: lock.path.clone(),
                            owner: lock.owner.clone(),
                        },
                    );
                    guard.locks.push(lock);
                }
                LockInsertResult::Conflict(held) => {
                    guard.release_quietly().await;
                    debug!("Tree {} is locked by {} holder(s)", path, held.len());
                    return Err(locked_tree(&path, &held));
                }
            }
        }

        debug!("{} holds tree locks {:?}", self.owner, guard.ids());
        Ok(guard)
    }

    /// Release a lock by id. Releasing a lock that is no longer held is a
    /// no-op returning `false`.
    pub async fn release(&self, lock_id: LockId) -> RepositoryResult<bool> {
        let path = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|l| l.id == lock_id)
            .map(|l| l.path);
        let Some(path) = path else {
            debug!("Tree lock {} already released", lock_id);
            return Ok(false);
        };

        let released = self.store.delete(lock_id).await?;
        if released {
            publish(&self.cluster, ClusterMessage::LockReleased { lock_id, path });
        }
        Ok(released)
    }

    pub async fn get_all_locks(&self) -> RepositoryResult<BTreeMap<LockId, RepositoryPath>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|l| (l.id, l.path))
            .collect())
    }

    pub async fn is_locked(&self, path: &RepositoryPath) -> RepositoryResult<bool> {
        Ok(!self.store.find_conflicts(path).await?.is_empty())
    }

    /// Fail with `LockedTree` if any lock overlaps one of `paths`.
    pub async fn assert_free(&self, paths: &[RepositoryPath]) -> RepositoryResult<()> {
        for path in paths {
            let held = self.store.find_conflicts(path).await?;
            if !held.is_empty() {
                return Err(locked_tree(path, &held));
            }
        }
        Ok(())
    }

    /// Run `work` while holding locks on `paths`.
    ///
    /// `work` is raced against `cancel`; the locks are released on every
    /// exit path.
    pub async fn run_locked<T, Fut>(
        &self,
        paths: &[RepositoryPath],
        cancel: &CancellationSignal,
        work: Fut,
    ) -> RepositoryResult<T>
    where
        Fut: Future<Output = RepositoryResult<T>>,
    {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let guard = self.acquire_all(paths).await?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RepositoryError::Cancelled),
            result = work => result,
        };

        if let Err(e) = guard.release().await {
            warn!("Failed to release tree locks: {}", e);
        }
        result
    }
}

impl fmt::Debug for TreeLockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLockRegistry")
            .field("store", &self.store.lock_type())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Keep only the paths not covered by another one in the list.
fn covering_paths(paths: &[RepositoryPath]) -> Vec<RepositoryPath> {
    let mut sorted: Vec<&RepositoryPath> = paths.iter().collect();
    sorted.sort_by_key(|p| p.depth());
    let mut kept: Vec<RepositoryPath> = Vec::new();
    for path in sorted {
        if !kept.iter().any(|k| path.is_within(k)) {
            kept.push(path.clone());
        }
    }
    kept
}

fn locked_tree(path: &RepositoryPath, held: &[TreeLock]) -> RepositoryError {
    RepositoryError::locked_tree(
        path.as_str(),
        held.iter().map(|l| l.path.to_string()).collect(),
    )
}

/// Held tree locks. Released by [`TreeLockGuard::release`] or, failing that,
/// synchronously on drop.
#[must_use = "tree locks are released when the guard is dropped"]
pub struct TreeLockGuard {
    store: Arc<dyn TreeLockStore>,
    cluster: Option<Arc<dyn ClusterChannel>>,
    locks: Vec<TreeLock>,
}

impl TreeLockGuard {
    pub fn locks(&self) -> &[TreeLock] {
        &self.locks
    }

    pub fn ids(&self) -> Vec<LockId> {
        self.locks.iter().map(|l| l.id).collect()
    }

    /// Release every held lock. All locks are attempted even if one fails;
    /// the first error is returned. Locks that failed stay in the guard and
    /// are retried once more when it drops.
    pub async fn release(mut self) -> RepositoryResult<()> {
        match self.release_held().await {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn release_quietly(&mut self) {
        self.release_held().await;
    }

    async fn release_held(&mut self) -> Option<StorageError> {
        let mut first_error = None;
        let mut failed = Vec::new();
        for lock in std::mem::take(&mut self.locks) {
            match self.store.delete(lock.id).await {
                Ok(released) => self.announce_release(lock, released),
                Err(e) => {
                    warn!("Failed to release tree lock {} on {}: {}", lock.id, lock.path, e);
                    first_error.get_or_insert(e);
                    failed.push(lock);
                }
            }
        }
        self.locks = failed;
        first_error
    }

    fn announce_release(&self, lock: TreeLock, released: bool) {
        if released {
            debug!("Released tree lock {} on {}", lock.id, lock.path);
            publish(
                &self.cluster,
                ClusterMessage::LockReleased {
                    lock_id: lock.id,
                    path: lock.path,
                },
            );
        }
    }
}

/// Run `release_now`. A store that blocks is moved off the async scheduler
/// with `block_in_place` on a multi-thread runtime; otherwise it runs inline.
fn release_blocking(store: &dyn TreeLockStore, lock_id: LockId) -> Result<bool, StorageError> {
    if !store.release_blocks() {
        return store.release_now(lock_id);
    }
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| store.release_now(lock_id))
        }
        _ => store.release_now(lock_id),
    }
}

impl Drop for TreeLockGuard {
    fn drop(&mut self) {
        for lock in std::mem::take(&mut self.locks) {
            match release_blocking(self.store.as_ref(), lock.id) {
                Ok(released) => self.announce_release(lock, released),
                Err(e) => warn!("Failed to release tree lock {} on {} on drop: {}", lock.id, lock.path, e),
            }
        }
    }
}

impl fmt::Debug for TreeLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeLockGuard").field("locks", &self.locks).finish()
    }
}
