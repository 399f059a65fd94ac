//! Test store that runs a one-shot hook between a read and its return.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use nodevault_core::{
    NewNode, NodeHead, NodeId, NodeRecord, RepositoryPath, StorageError, Version, VersionChange, VersionHistory,
    VersionId, VersionStore,
};

use super::MemoryVersionStore;

type Hook = (NodeId, BoxFuture<'static, ()>);

/// Delegates to a [`MemoryVersionStore`]. A hook armed for a node runs once,
/// after the inner read completed and before its result is returned, so the
/// caller sees a value that is already stale.
pub struct InterceptingStore {
    inner: Arc<MemoryVersionStore>,
    after_load_node: Mutex<Option<Hook>>,
    after_load_node_head: Mutex<Option<Hook>>,
}

impl InterceptingStore {
    pub fn new(inner: Arc<MemoryVersionStore>) -> Self {
        Self {
            inner,
            after_load_node: Mutex::new(None),
            after_load_node_head: Mutex::new(None),
        }
    }

    pub fn after_load_node(&self, node_id: NodeId, hook: BoxFuture<'static, ()>) {
        *self.after_load_node.lock().unwrap() = Some((node_id, hook));
    }

    pub fn after_load_node_head(&self, node_id: NodeId, hook: BoxFuture<'static, ()>) {
        *self.after_load_node_head.lock().unwrap() = Some((node_id, hook));
    }

    fn take(slot: &Mutex<Option<Hook>>, node_id: NodeId) -> Option<BoxFuture<'static, ()>> {
        let mut slot = slot.lock().unwrap();
        match slot.as_ref() {
            Some((armed, _)) if *armed == node_id => slot.take().map(|(_, hook)| hook),
            _ => None,
        }
    }
}

#[async_trait]
impl VersionStore for InterceptingStore {
    fn backend_name(&self) -> &'static str {
        "intercepting"
    }

    async fn create_node(&self, node: NewNode) -> Result<NodeRecord, StorageError> {
        self.inner.create_node(node).await
    }

    async fn load_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>, StorageError> {
        let record = self.inner.load_node(node_id).await?;
        if let Some(hook) = Self::take(&self.after_load_node, node_id) {
            hook.await;
        }
        Ok(record)
    }

    async fn load_node_by_path(&self, path: &RepositoryPath) -> Result<Option<NodeRecord>, StorageError> {
        self.inner.load_node_by_path(path).await
    }

    async fn load_children(&self, node_id: NodeId) -> Result<Vec<NodeRecord>, StorageError> {
        self.inner.load_children(node_id).await
    }

    async fn load_node_head(&self, node_id: NodeId) -> Result<Option<NodeHead>, StorageError> {
        let head = self.inner.load_node_head(node_id).await?;
        if let Some(hook) = Self::take(&self.after_load_node_head, node_id) {
            hook.await;
        }
        Ok(head)
    }

    async fn load_node_heads(&self, node_ids: &[NodeId]) -> Result<Vec<NodeHead>, StorageError> {
        self.inner.load_node_heads(node_ids).await
    }

    async fn load_history(&self, node_id: NodeId) -> Result<Option<VersionHistory>, StorageError> {
        self.inner.load_history(node_id).await
    }

    async fn load_version(&self, version_id: VersionId) -> Result<Option<Version>, StorageError> {
        self.inner.load_version(version_id).await
    }

    async fn load_versions(&self, version_ids: &[VersionId]) -> Result<Vec<Version>, StorageError> {
        self.inner.load_versions(version_ids).await
    }

    async fn commit_versions(
        &self,
        node_id: NodeId,
        expected_revision: u64,
        changes: &[VersionChange],
    ) -> Result<NodeHead, StorageError> {
        self.inner.commit_versions(node_id, expected_revision, changes).await
    }

    async fn move_subtree(
        &self,
        node_id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<Vec<NodeRecord>, StorageError> {
        self.inner.move_subtree(node_id, new_parent, new_name).await
    }

    async fn copy_subtree(
        &self,
        node_id: NodeId,
        target_parent: NodeId,
        new_name: &str,
    ) -> Result<Vec<NodeRecord>, StorageError> {
        self.inner.copy_subtree(node_id, target_parent, new_name).await
    }

    async fn delete_subtree(&self, node_id: NodeId) -> Result<Vec<NodeRecord>, StorageError> {
        self.inner.delete_subtree(node_id).await
    }
}
