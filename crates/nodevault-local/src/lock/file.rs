use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use nodevault_core::like::LikePattern;
use nodevault_core::{LockId, LockInsertResult, RepositoryPath, StorageError, TreeLock, TreeLockStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

const TABLE_FILE: &str = "tree_locks.json";
const GUARD_FILE: &str = "tree_locks.lock";

/// Tree lock table shared by every process pointing at the same directory.
///
/// The table lives in `{dir}/tree_locks.json`. Every read-modify-write runs
/// while holding an OS-level exclusive lock on `{dir}/tree_locks.lock`
/// (flock on Unix, LockFile on Windows), and the table is replaced
/// atomically through a temp file and a rename.
///
/// The overlap check is written the way a SQL back end would answer it,
/// with `LIKE` patterns built from escaped paths.
#[derive(Debug, Clone)]
pub struct FileTreeLockStore {
    dir: PathBuf,
    /// Locks older than this are considered abandoned by a crashed holder.
    stale_after: Option<Duration>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LockTable {
    next_id: u64,
    #[serde(default)]
    locks: Vec<TreeLock>,
}

impl LockTable {
    fn conflicts(&self, path: &RepositoryPath) -> Vec<TreeLock> {
        let requested = path.as_str();
        let below_requested = LikePattern::descendants_of(requested);
        self.locks
            .iter()
            .filter(|lock| {
                let held = lock.path.as_str();
                held.eq_ignore_ascii_case(requested)
                    || below_requested.matches(held)
                    || LikePattern::descendants_of(held).matches(requested)
            })
            .cloned()
            .collect()
    }

    fn remove(&mut self, lock_id: LockId) -> Option<TreeLock> {
        let pos = self.locks.iter().position(|l| l.id == lock_id)?;
        Some(self.locks.remove(pos))
    }
}

impl FileTreeLockStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self) -> PathBuf {
        self.dir.join(TABLE_FILE)
    }

    fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            StorageError::Io(format!("Failed to create lock dir {}: {}", self.dir.display(), e))
        })
    }

    fn open_guard(&self) -> Result<File, StorageError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(GUARD_FILE))
            .map_err(|e| StorageError::Io(format!("Failed to open lock guard file: {}", e)))
    }

    fn read_table(&self) -> Result<LockTable, StorageError> {
        let path = self.table_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockTable::default()),
            Err(e) => return Err(StorageError::Io(format!("Failed to read lock table: {}", e))),
        };
        // Never replaced when corrupt: held locks and the id counter must survive.
        serde_json::from_str(&content).map_err(|e| {
            warn!("Lock table {} is unreadable, refusing lock operations: {}", path.display(), e);
            StorageError::Serialization(format!(
                "Failed to parse lock table {} (repair or remove it once no holder is running): {}",
                path.display(),
                e
            ))
        })
    }

    fn write_table(&self, table: &LockTable) -> Result<(), StorageError> {
        let path = self.table_path();
        let temp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(table).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize lock table: {}", e))
        })?;
        fs::write(&temp_path, content)
            .map_err(|e| StorageError::Io(format!("Failed to write lock table: {}", e)))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| StorageError::Io(format!("Failed to rename lock table: {}", e)))?;
        Ok(())
    }

    /// Drop locks held longer than `stale_after`. Returns whether any went.
    fn purge_stale(&self, table: &mut LockTable) -> bool {
        let Some(stale_after) = self.stale_after else {
            return false;
        };
        let Ok(max_age) = chrono::Duration::from_std(stale_after) else {
            return false;
        };
        let cutoff = Utc::now() - max_age;
        let before = table.locks.len();
        table.locks.retain(|lock| {
            let stale = lock.acquired_at < cutoff;
            if stale {
                warn!(
                    "Purging stale tree lock {} on {} held by {} since {}",
                    lock.id, lock.path, lock.owner, lock.acquired_at
                );
            }
            !stale
        });
        table.locks.len() != before
    }

    /// Run `f` on the table under the guard lock. `f` returns its result and
    /// whether it modified the table.
    fn transact<T>(&self, f: impl FnOnce(&mut LockTable) -> (T, bool)) -> Result<T, StorageError> {
        self.ensure_dir()?;
        let guard = self.open_guard()?;
        guard
            .lock_exclusive()
            .map_err(|e| StorageError::Lock(format!("Failed to lock tree lock table: {}", e)))?;

        let result = self.read_table().and_then(|mut table| {
            let purged = self.purge_stale(&mut table);
            let (out, changed) = f(&mut table);
            if changed || purged {
                self.write_table(&table)?;
            }
            Ok(out)
        });

        let _ = FileExt::unlock(&guard);
        result
    }

    async fn transact_blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LockTable) -> (T, bool) + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.transact(f))
            .await
            .map_err(|e| StorageError::Internal(format!("Lock table task failed: {}", e)))?
    }

    fn delete_now(&self, lock_id: LockId) -> Result<bool, StorageError> {
        self.transact(|table| match table.remove(lock_id) {
            Some(lock) => {
                debug!("Released tree lock {} on {}", lock_id, lock.path);
                (true, true)
            }
            None => {
                debug!("Tree lock {} not held", lock_id);
                (false, false)
            }
        })
    }
}

#[async_trait]
impl TreeLockStore for FileTreeLockStore {
    fn lock_type(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn try_insert(&self, path: &RepositoryPath, owner: &str) -> Result<LockInsertResult, StorageError> {
        let path = path.clone();
        let owner = owner.to_string();
        self.transact_blocking(move |table| {
            let conflicts = table.conflicts(&path);
            if !conflicts.is_empty() {
                debug!("Tree lock on {} refused: {} overlapping lock(s)", path, conflicts.len());
                return (LockInsertResult::Conflict(conflicts), false);
            }

            table.next_id += 1;
            let lock = TreeLock {
                id: LockId(table.next_id),
                path,
                owner,
                acquired_at: Utc::now(),
            };
            debug!("Acquired tree lock {} on {} for {}", lock.id, lock.path, lock.owner);
            table.locks.push(lock.clone());
            (LockInsertResult::Acquired(lock), true)
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, lock_id: LockId) -> Result<bool, StorageError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.delete_now(lock_id))
            .await
            .map_err(|e| StorageError::Internal(format!("Lock table task failed: {}", e)))?
    }

    async fn list(&self) -> Result<Vec<TreeLock>, StorageError> {
        self.transact_blocking(|table| (table.locks.clone(), false)).await
    }

    async fn find_conflicts(&self, path: &RepositoryPath) -> Result<Vec<TreeLock>, StorageError> {
        let path = path.clone();
        self.transact_blocking(move |table| (table.conflicts(&path), false))
            .await
    }

    fn release_now(&self, lock_id: LockId) -> Result<bool, StorageError> {
        self.delete_now(lock_id)
    }

    fn release_blocks(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Barrier;

    fn setup() -> (FileTreeLockStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTreeLockStore::new(temp_dir.path());
        (store, temp_dir)
    }

    fn path(s: &str) -> RepositoryPath {
        RepositoryPath::parse(s).unwrap()
    }

    async fn acquire(store: &FileTreeLockStore, p: &str) -> Option<TreeLock> {
        match store.try_insert(&path(p), "test").await.unwrap() {
            LockInsertResult::Acquired(lock) => Some(lock),
            LockInsertResult::Conflict(_) => None,
        }
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (store, _temp) = setup();

        let lock = acquire(&store, "/Root/A/B").await.unwrap();
        assert!(acquire(&store, "/Root/A/B/C").await.is_none());
        assert!(acquire(&store, "/Root/A").await.is_none());
        assert!(acquire(&store, "/ROOT/A/B").await.is_none());
        assert!(acquire(&store, "/Root/A/BC").await.is_some());

        assert!(store.delete(lock.id).await.unwrap());
        assert!(!store.delete(lock.id).await.unwrap());
        assert!(acquire(&store, "/Root/A/B/C").await.is_some());
    }

    #[tokio::test]
    async fn test_pattern_characters_are_escaped() {
        let (store, _temp) = setup();

        acquire(&store, "/Root/A/B_B").await.unwrap();
        assert!(acquire(&store, "/Root/A/BxB/C").await.is_some());
        assert!(acquire(&store, "/Root/A/B_B/C").await.is_none());

        acquire(&store, "/Root/P%").await.unwrap();
        assert!(acquire(&store, "/Root/Pxyz/Q").await.is_some());

        acquire(&store, "/Root/[ab]").await.unwrap();
        assert!(acquire(&store, "/Root/a/child").await.is_some());
        assert!(acquire(&store, "/Root/[ab]/child").await.is_none());
    }

    #[tokio::test]
    async fn test_table_is_shared_between_instances() {
        let (store, temp) = setup();
        let other = FileTreeLockStore::new(temp.path());

        let lock = acquire(&store, "/Root/A").await.unwrap();
        assert!(acquire(&other, "/Root/A/B").await.is_none());
        assert_eq!(other.list().await.unwrap(), vec![lock.clone()]);

        assert!(other.release_now(lock.id).unwrap());
        assert!(acquire(&store, "/Root/A/B").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_locks_are_purged() {
        let (store, temp) = setup();
        acquire(&store, "/Root/A").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let strict = FileTreeLockStore::new(temp.path()).with_stale_after(Duration::from_millis(10));
        assert!(acquire(&strict, "/Root/A").await.is_some());
        assert_eq!(strict.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_table_fails_closed() {
        let (store, temp) = setup();
        let table = temp.path().join(TABLE_FILE);
        let held = acquire(&store, "/Root/A").await.unwrap();
        let intact = fs::read_to_string(&table).unwrap();

        fs::write(&table, "{not json").unwrap();
        let err = store.try_insert(&path("/Root/A/Child"), "other").await.unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
        assert!(store.list().await.is_err());
        assert!(store.release_now(held.id).is_err());
        assert_eq!(fs::read_to_string(&table).unwrap(), "{not json");

        // Once repaired, the held lock is still there and ids keep counting up.
        fs::write(&table, intact).unwrap();
        assert!(acquire(&store, "/Root/A/Child").await.is_none());
        assert!(store.delete(held.id).await.unwrap());
        let next = acquire(&store, "/Root/A/Child").await.unwrap();
        assert!(next.id > held.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let barrier = Arc::new(Barrier::new(8));
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            // Separate instances, as separate processes would have.
            let store = FileTreeLockStore::new(temp_dir.path());
            let barrier = barrier.clone();
            let winners = winners.clone();
            let target = if i % 2 == 0 { "/Root/A" } else { "/Root/A/B" };
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if let LockInsertResult::Acquired(_) = store.try_insert(&path(target), &format!("w{}", i)).await.unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        let store = FileTreeLockStore::new(temp_dir.path());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
