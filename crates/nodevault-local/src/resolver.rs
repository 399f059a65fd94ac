//! Resolve `NodeHead`s to version snapshots.
//!
//! A head is a point-in-time projection. Between capturing it and loading
//! the version it names, a concurrent check-in may have collapsed that
//! version away or the node may have been deleted. Fixed selectors report a
//! vanished version as `None`; `LastAccessible` reloads the head and follows
//! the fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use nodevault_core::{
    NodeHead, NodeId, Permission, PermissionChecker, RepositoryError, RepositoryResult, VersionId,
    VersionNumber, VersionSnapshot, VersionStore,
};
use tracing::debug;

use crate::cache::HeadCache;

const DEFAULT_MAX_RELOADS: usize = 3;

/// Which version of a node to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelector {
    Exact(VersionId),
    Number(VersionNumber),
    /// Latest approved version.
    LastMajor,
    /// Latest non-rejected version.
    LastMinor,
    /// `LastMinor` for callers allowed to see unapproved versions,
    /// `LastMajor` for everybody else.
    LastAccessible,
}

pub struct HeadResolver {
    store: Arc<dyn VersionStore>,
    permissions: Arc<dyn PermissionChecker>,
    cache: Option<HeadCache>,
    max_reloads: usize,
}

impl HeadResolver {
    pub fn new(store: Arc<dyn VersionStore>, permissions: Arc<dyn PermissionChecker>) -> Self {
        Self {
            store,
            permissions,
            cache: None,
            max_reloads: DEFAULT_MAX_RELOADS,
        }
    }

    pub fn with_cache(mut self, cache: HeadCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_max_reloads(mut self, max_reloads: usize) -> Self {
        self.max_reloads = max_reloads;
        self
    }

    /// Current head of a node, from the cache when one is configured.
    pub async fn head(&self, node_id: NodeId) -> RepositoryResult<Arc<NodeHead>> {
        let head = match &self.cache {
            Some(cache) => cache.get(node_id).await?,
            None => self.store.load_node_head(node_id).await?.map(Arc::new),
        };
        head.ok_or(RepositoryError::NodeNotFound(node_id))
    }

    async fn reload_head(&self, node_id: NodeId) -> RepositoryResult<Option<NodeHead>> {
        if let Some(cache) = &self.cache {
            cache.invalidate_node(node_id).await;
        }
        Ok(self.store.load_node_head(node_id).await?)
    }

    async fn can_open_minor(&self, node_id: NodeId) -> RepositoryResult<bool> {
        Ok(self.permissions.has_permission(node_id, Permission::OpenMinor).await?)
    }

    async fn select(&self, head: &NodeHead, selector: VersionSelector) -> RepositoryResult<Option<VersionId>> {
        let id = match selector {
            VersionSelector::Exact(id) => Some(id).filter(|id| id.node_id == head.node_id),
            VersionSelector::Number(number) => head.entry_by_number(number).map(|e| e.id),
            VersionSelector::LastMajor => head.last_major_version_id,
            VersionSelector::LastMinor => head.last_minor_version_id,
            VersionSelector::LastAccessible => {
                if self.can_open_minor(head.node_id).await? {
                    head.last_minor_version_id
                } else {
                    head.last_major_version_id
                }
            }
        };
        Ok(id)
    }

    /// Load the version `selector` picks from `head`.
    ///
    /// `Ok(None)` when there is no such version or it has vanished since the
    /// head was captured.
    pub async fn load_version(
        &self,
        head: &NodeHead,
        selector: VersionSelector,
    ) -> RepositoryResult<Option<VersionSnapshot>> {
        let Some(id) = self.select(head, selector).await? else {
            return Ok(None);
        };
        if let Some(version) = self.store.load_version(id).await? {
            return Ok(Some(VersionSnapshot::new(head, version)));
        }
        if selector != VersionSelector::LastAccessible {
            debug!("Version {} of {} vanished", id, head.path);
            return Ok(None);
        }
        self.follow_fresh_head(head.node_id, id).await
    }

    /// The version a `LastAccessible` lookup pointed at is gone: retry
    /// against freshly loaded heads.
    async fn follow_fresh_head(&self, node_id: NodeId, mut missing: VersionId) -> RepositoryResult<Option<VersionSnapshot>> {
        for attempt in 1..=self.max_reloads {
            debug!("Version {} vanished, reloading head of node {} (attempt {})", missing, node_id, attempt);
            let Some(head) = self.reload_head(node_id).await? else {
                return Ok(None);
            };
            let Some(id) = self.select(&head, VersionSelector::LastAccessible).await? else {
                return Ok(None);
            };
            if let Some(version) = self.store.load_version(id).await? {
                return Ok(Some(VersionSnapshot::new(&head, version)));
            }
            missing = id;
        }
        debug!("Giving up on node {} after {} reloads", node_id, self.max_reloads);
        Ok(None)
    }

    /// Load one version per head with a single batch read.
    ///
    /// Slots are independent: a node that disappeared yields `None` in its
    /// own slot without affecting the others.
    pub async fn load_versions(
        &self,
        heads: &[NodeHead],
        selector: VersionSelector,
    ) -> RepositoryResult<Vec<Option<VersionSnapshot>>> {
        let mut ids = Vec::with_capacity(heads.len());
        for head in heads {
            ids.push(self.select(head, selector).await?);
        }

        let wanted: Vec<VersionId> = ids.iter().flatten().copied().collect();
        let mut loaded: HashMap<VersionId, _> = self
            .store
            .load_versions(&wanted)
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        let mut slots: Vec<Option<VersionSnapshot>> = Vec::with_capacity(heads.len());
        let mut missing = Vec::new();
        for (index, (head, id)) in heads.iter().zip(&ids).enumerate() {
            match id.and_then(|id| loaded.remove(&id)) {
                Some(version) => slots.push(Some(VersionSnapshot::new(head, version))),
                None => {
                    slots.push(None);
                    if let (Some(id), VersionSelector::LastAccessible) = (id, selector) {
                        missing.push((index, head.node_id, *id));
                    }
                }
            }
        }

        if !missing.is_empty() {
            debug!("{} of {} version(s) vanished, resolving individually", missing.len(), heads.len());
            let retries = missing
                .iter()
                .map(|(_, node_id, id)| self.follow_fresh_head(*node_id, *id));
            for ((index, _, _), result) in missing.iter().zip(join_all(retries).await) {
                slots[*index] = result?;
            }
        }

        Ok(slots)
    }

    /// [`HeadResolver::load_versions`] without the vanished entries.
    pub async fn load_existing_versions(
        &self,
        heads: &[NodeHead],
        selector: VersionSelector,
    ) -> RepositoryResult<Vec<VersionSnapshot>> {
        Ok(self
            .load_versions(heads, selector)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nodevault_core::{
        transition, ApprovingMode, NewNode, NodeTypeId, Properties, VersionOperation, VersionPolicy, VersionStatus,
        VersioningMode,
    };
    use std::time::Duration;

    use crate::security::{AllowAll, PermissionTable};
    use crate::storage::MemoryVersionStore;

    struct Fixture {
        store: Arc<MemoryVersionStore>,
        permissions: Arc<PermissionTable>,
        resolver: HeadResolver,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryVersionStore::new());
        let permissions = Arc::new(PermissionTable::new());
        let resolver = HeadResolver::new(store.clone(), permissions.clone());
        Fixture {
            store,
            permissions,
            resolver,
        }
    }

    async fn node(store: &MemoryVersionStore, name: &str) -> NodeId {
        store
            .create_node(NewNode::new(None, name, NodeTypeId(1)))
            .await
            .unwrap()
            .id
    }

    async fn apply(store: &MemoryVersionStore, node_id: NodeId, policy: VersionPolicy, op: VersionOperation) -> NodeHead {
        let history = store.load_history(node_id).await.unwrap().unwrap();
        let next = transition(&history, &op, policy, Utc::now()).unwrap();
        store
            .commit_versions(node_id, history.revision(), &next.effect.changes)
            .await
            .unwrap()
    }

    fn save(title: &str) -> VersionOperation {
        VersionOperation::Save {
            properties: Properties::new().with("Title", title),
        }
    }

    fn check_out() -> VersionOperation {
        VersionOperation::CheckOut {
            owner: "alice".to_string(),
        }
    }

    const NONE: VersionPolicy = VersionPolicy::new(VersioningMode::None, ApprovingMode::False);
    const MINOR_APPROVING: VersionPolicy = VersionPolicy::new(VersioningMode::MajorAndMinor, ApprovingMode::True);

    fn title(snapshot: &VersionSnapshot) -> &str {
        snapshot.properties.get("Title").and_then(|v| v.as_str()).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_exact_round_trip() {
        let f = fixture();
        let id = node(&f.store, "Doc").await;
        let head = apply(&f.store, id, NONE, save("first")).await;

        let version_id = head.last_minor_version_id.unwrap();
        let snapshot = f
            .resolver
            .load_version(&head, VersionSelector::Exact(version_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.version_id, version_id);
        assert_eq!(snapshot.label(), "V1.0.A");
        assert_eq!(snapshot.path, head.path);
        assert_eq!(title(&snapshot), "first");

        let other_node = VersionId::new(NodeId(999), version_id.seq);
        assert!(f
            .resolver
            .load_version(&head, VersionSelector::Exact(other_node))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_last_accessible_depends_on_open_minor() {
        let f = fixture();
        let id = node(&f.store, "Doc").await;
        apply(&f.store, id, MINOR_APPROVING, save("draft")).await;
        apply(&f.store, id, MINOR_APPROVING, VersionOperation::Publish).await;
        apply(&f.store, id, MINOR_APPROVING, VersionOperation::Approve).await;
        let head = apply(&f.store, id, MINOR_APPROVING, save("newer draft")).await;
        assert_eq!(head.summary(), "V0.1.A,V1.0.D");

        let minor = f
            .resolver
            .load_version(&head, VersionSelector::LastAccessible)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(minor.label(), "V1.0.D");

        f.permissions.deny(id, Permission::OpenMinor);
        let major = f
            .resolver
            .load_version(&head, VersionSelector::LastAccessible)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(major.label(), "V0.1.A");

        let by_number = f
            .resolver
            .load_version(&head, VersionSelector::Number(VersionNumber::new(1, 0)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(title(&by_number), "newer draft");
    }

    #[tokio::test]
    async fn test_lost_version_follows_fresh_head() {
        let f = fixture();
        let id = node(&f.store, "Doc").await;
        let before_check_out = apply(&f.store, id, NONE, save("v1")).await;
        apply(&f.store, id, NONE, check_out()).await;
        let captured = apply(&f.store, id, NONE, save("edited")).await;
        assert_eq!(captured.summary(), "V1.0.A,V2.0.L");
        let locked_id = captured
            .versions
            .iter()
            .find(|e| e.status == VersionStatus::Locked)
            .map(|e| e.id)
            .unwrap();

        // Check-in collapses the locked version onto V1.0.
        let fresh = apply(&f.store, id, NONE, VersionOperation::CheckIn).await;
        assert_eq!(fresh.summary(), "V1.0.A");

        assert!(f
            .resolver
            .load_version(&captured, VersionSelector::Exact(locked_id))
            .await
            .unwrap()
            .is_none());
        assert!(f
            .resolver
            .load_version(&captured, VersionSelector::LastMinor)
            .await
            .unwrap()
            .is_none());

        let reloaded = f.resolver.head(id).await.unwrap();
        assert_eq!(reloaded.summary(), "V1.0.A");
        assert!(reloaded.entry(locked_id).is_none());

        // The pre-checkout head still points at a surviving version.
        let survivor = f
            .resolver
            .load_version(&before_check_out, VersionSelector::LastMinor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(title(&survivor), "edited");

        let snapshot = f
            .resolver
            .load_version(&captured, VersionSelector::LastAccessible)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.label(), "V1.0.A");
        assert_eq!(title(&snapshot), "edited");
    }

    #[tokio::test]
    async fn test_deleted_node_yields_none() {
        let f = fixture();
        let id = node(&f.store, "Doc").await;
        let head = apply(&f.store, id, NONE, save("v1")).await;
        f.store.delete_subtree(id).await.unwrap();

        assert!(f
            .resolver
            .load_version(&head, VersionSelector::LastAccessible)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            f.resolver.head(id).await,
            Err(RepositoryError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_slots_are_independent() {
        let f = fixture();
        let a = node(&f.store, "A").await;
        let b = node(&f.store, "B").await;
        let c = node(&f.store, "C").await;
        let head_a = apply(&f.store, a, NONE, save("a")).await;
        let head_b = apply(&f.store, b, NONE, save("b")).await;
        let head_c = f.store.load_node_head(c).await.unwrap().unwrap();

        f.store.delete_subtree(a).await.unwrap();

        let heads = vec![head_a, head_b, head_c];
        for selector in [VersionSelector::LastMinor, VersionSelector::LastAccessible] {
            let slots = f.resolver.load_versions(&heads, selector).await.unwrap();
            assert_eq!(slots.len(), 3);
            assert!(slots[0].is_none());
            assert_eq!(slots[1].as_ref().map(title), Some("b"));
            assert!(slots[2].is_none());
        }

        let existing = f
            .resolver
            .load_existing_versions(&heads, VersionSelector::LastMajor)
            .await
            .unwrap();
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].node_id, b);
    }

    #[tokio::test]
    async fn test_head_served_from_cache() {
        let store = Arc::new(MemoryVersionStore::new());
        let cache = HeadCache::new(store.clone(), Duration::from_secs(60), 100);
        let resolver = HeadResolver::new(store.clone(), Arc::new(AllowAll)).with_cache(cache);
        let id = node(&store, "Doc").await;

        let first = resolver.head(id).await.unwrap();
        let second = resolver.head(id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
