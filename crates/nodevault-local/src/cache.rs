//! Node head cache.
//!
//! Serves shared `Arc<NodeHead>`s from a moka cache in front of the version
//! store. Entries are dropped on local invalidation events and on
//! `HeadInvalidated` messages from other processes.
//!
//! A miss loads from the store and then inserts. An invalidation that lands
//! in between bumps the epoch, and the loader drops its own insert again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use nodevault_core::{ClusterMessage, InvalidationEvent, InvalidationSink, NodeHead, NodeId, StorageError, VersionStore};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct HeadCache {
    store: Arc<dyn VersionStore>,
    cache: Cache<NodeId, Arc<NodeHead>>,
    /// Bumped before every invalidation.
    epoch: Arc<AtomicU64>,
}

impl HeadCache {
    pub fn new(store: Arc<dyn VersionStore>, ttl: Duration, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_capacity)
            .build();
        Self {
            store,
            cache,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cached head of `node_id`, loaded from the store on a miss.
    pub async fn get(&self, node_id: NodeId) -> Result<Option<Arc<NodeHead>>, StorageError> {
        if let Some(head) = self.cache.get(&node_id).await {
            debug!("Head cache hit for node {}", node_id);
            return Ok(Some(head));
        }

        debug!("Head cache miss for node {}", node_id);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(head) = self.store.load_node_head(node_id).await? else {
            return Ok(None);
        };
        let head = Arc::new(head);
        self.cache.insert(node_id, head.clone()).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Head of node {} invalidated while loading, not keeping it", node_id);
            self.cache.invalidate(&node_id).await;
        }
        Ok(Some(head))
    }

    pub async fn invalidate_node(&self, node_id: NodeId) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(&node_id).await;
    }

    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate_all();
    }

    /// Drop entries named by `HeadInvalidated` messages until the channel
    /// closes. A lagging receiver may have missed messages, so it clears
    /// the whole cache.
    pub fn listen(&self, mut rx: broadcast::Receiver<ClusterMessage>) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ClusterMessage::HeadInvalidated { node_id, path }) => {
                        debug!("Dropping cached head of {} ({})", node_id, path);
                        cache.invalidate_node(node_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Head cache listener missed {} message(s), clearing cache", missed);
                        cache.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl InvalidationSink for HeadCache {
    async fn invalidate(&self, event: &InvalidationEvent) {
        self.invalidate_node(event.node_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::FutureExt;
    use nodevault_core::{
        ClusterChannel, InvalidationReason, NewNode, NodeTypeId, OperationKind, Properties, RepositoryPath,
        Version, VersionChange, VersionNumber, VersionStatus,
    };
    use tokio::sync::oneshot;

    use crate::notify::BroadcastCluster;
    use crate::storage::intercept::InterceptingStore;
    use crate::storage::MemoryVersionStore;

    async fn setup() -> (Arc<MemoryVersionStore>, HeadCache, NodeId) {
        let store = Arc::new(MemoryVersionStore::new());
        let node = store
            .create_node(NewNode::new(None, "Root", NodeTypeId(1)))
            .await
            .unwrap();
        let cache = HeadCache::new(store.clone(), Duration::from_secs(60), 100);
        (store, cache, node.id)
    }

    async fn add_version(store: &MemoryVersionStore, node_id: NodeId) {
        let history = store.load_history(node_id).await.unwrap().unwrap();
        let version = Version {
            id: history.next_id(),
            number: history
                .highest_number()
                .map_or(VersionNumber::new(1, 0), |n| n.next_major()),
            status: VersionStatus::Approved,
            created_at: Utc::now(),
            locked_by: None,
            properties: Properties::new(),
        };
        store
            .commit_versions(node_id, history.revision(), &[VersionChange::Insert { version }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_serves_cached_until_invalidated() {
        let (store, cache, node_id) = setup().await;
        let first = cache.get(node_id).await.unwrap().unwrap();
        assert!(first.versions.is_empty());

        add_version(&store, node_id).await;
        let cached = cache.get(node_id).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        let event = InvalidationEvent {
            node_id,
            path: first.path.clone(),
            node_type_id: first.node_type_id,
            reason: InvalidationReason::Version(OperationKind::Save),
        };
        cache.invalidate(&event).await;
        assert_eq!(cache.get(node_id).await.unwrap().unwrap().summary(), "V1.0.A");
    }

    #[tokio::test]
    async fn test_invalidation_during_miss_is_not_lost() {
        let inner = Arc::new(MemoryVersionStore::new());
        let node_id = inner
            .create_node(NewNode::new(None, "Root", NodeTypeId(1)))
            .await
            .unwrap()
            .id;
        let store = Arc::new(InterceptingStore::new(inner.clone()));
        let cache = HeadCache::new(store.clone(), Duration::from_secs(60), 100);

        let (loaded_tx, loaded_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel::<()>();
        store.after_load_node_head(node_id, async move {
            let _ = loaded_tx.send(());
            let _ = resume_rx.await;
        }.boxed());

        let loader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(node_id).await.unwrap().unwrap() })
        };
        loaded_rx.await.unwrap();

        // A commit and its invalidation land while the loader holds the old head.
        add_version(&inner, node_id).await;
        let event = InvalidationEvent {
            node_id,
            path: RepositoryPath::parse("/Root").unwrap(),
            node_type_id: NodeTypeId(1),
            reason: InvalidationReason::Version(OperationKind::Save),
        };
        cache.invalidate(&event).await;
        resume_tx.send(()).unwrap();

        let stale = loader.await.unwrap();
        assert!(stale.versions.is_empty());
        assert_eq!(cache.get(node_id).await.unwrap().unwrap().summary(), "V1.0.A");
    }

    #[tokio::test]
    async fn test_missing_node_is_not_cached() {
        let (_store, cache, _node_id) = setup().await;
        assert!(cache.get(NodeId(404)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_drops_invalidated_heads() {
        let (store, cache, node_id) = setup().await;
        let cluster = BroadcastCluster::new(16);
        let listener = cache.listen(cluster.subscribe());

        let head = cache.get(node_id).await.unwrap().unwrap();
        add_version(&store, node_id).await;
        cluster
            .publish(ClusterMessage::HeadInvalidated {
                node_id,
                path: head.path.clone(),
            })
            .unwrap();

        let mut refreshed = false;
        for _ in 0..100 {
            if !cache.get(node_id).await.unwrap().unwrap().versions.is_empty() {
                refreshed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(refreshed);

        drop(cluster);
        listener.await.unwrap();
    }
}
