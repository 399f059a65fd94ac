//! Structural tree operations: move, copy, delete and rename.
//!
//! Each operation checks permissions, takes tree locks on every affected
//! path, mutates the store in one call and announces every touched node.
//! Paths are read before locking, so every involved node is reloaded under
//! the locks and the operation fails with `NodeMoved` if one of them is no
//! longer where it was locked. The locks are released on every exit path,
//! including cancellation.

use std::sync::Arc;

use nodevault_core::{
    ClusterChannel, InvalidationReason, InvalidationSink, NodeId, NodeRecord, Permission, PermissionChecker,
    RepositoryError, RepositoryResult, VersionStore,
};
use tracing::{debug, info, instrument};

use crate::cancel::CancellationSignal;
use crate::lock::TreeLockRegistry;
use crate::notify::Notifier;

pub struct TreeService {
    store: Arc<dyn VersionStore>,
    locks: TreeLockRegistry,
    permissions: Arc<dyn PermissionChecker>,
    notifier: Notifier,
}

impl TreeService {
    pub fn new(
        store: Arc<dyn VersionStore>,
        locks: TreeLockRegistry,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        Self {
            store,
            locks,
            permissions,
            notifier: Notifier::default(),
        }
    }

    pub fn with_invalidation(mut self, invalidation: Arc<dyn InvalidationSink>) -> Self {
        self.notifier = Notifier::new(invalidation);
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterChannel>) -> Self {
        self.notifier = self.notifier.with_cluster(cluster);
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    async fn require_permission(&self, node_id: NodeId, permission: Permission) -> RepositoryResult<()> {
        if self.permissions.has_permission(node_id, permission).await? {
            Ok(())
        } else {
            Err(RepositoryError::PermissionDenied { node_id, permission })
        }
    }

    async fn load_node(&self, node_id: NodeId) -> RepositoryResult<NodeRecord> {
        self.store
            .load_node(node_id)
            .await?
            .ok_or(RepositoryError::NodeNotFound(node_id))
    }

    /// Fail if any of `nodes` no longer sits at the path its locks cover.
    async fn ensure_unmoved(&self, nodes: &[&NodeRecord]) -> RepositoryResult<()> {
        for node in nodes {
            let current = self.load_node(node.id).await?;
            if current.path != node.path {
                debug!("Node {} moved from {} to {} before it was locked", node.id, node.path, current.path);
                return Err(RepositoryError::NodeMoved {
                    node_id: node.id,
                    locked: node.path.to_string(),
                    current: current.path.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn announce(&self, records: &[NodeRecord], reason: InvalidationReason) {
        for record in records {
            self.notifier
                .node_changed(record.id, &record.path, record.node_type_id, reason)
                .await;
        }
    }

    /// Move a subtree under `target_parent`, keeping its name.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn move_node(
        &self,
        node_id: NodeId,
        target_parent: NodeId,
        cancel: &CancellationSignal,
    ) -> RepositoryResult<Vec<NodeRecord>> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let node = self.load_node(node_id).await?;
        let target = self.load_node(target_parent).await?;
        self.require_permission(node_id, Permission::Delete).await?;
        self.require_permission(target_parent, Permission::AddNew).await?;

        if target.path.is_within(&node.path) {
            return Err(RepositoryError::InvalidOperation(format!(
                "cannot move {} under itself ({})",
                node.path, target.path
            )));
        }
        let destination = target.path.join(&node.name)?;

        let moved = self
            .locks
            .run_locked(&[node.path.clone(), destination.clone()], cancel, async {
                self.ensure_unmoved(&[&node, &target]).await?;
                self.store.move_subtree(node_id, target_parent, &node.name).await.map_err(RepositoryError::from)
            })
            .await?;

        self.announce(&moved, InvalidationReason::Moved).await;
        info!("Moved {} to {} ({} node(s))", node.path, destination, moved.len());
        Ok(moved)
    }

    /// Copy a subtree under `target_parent` as `new_name` (defaults to the
    /// source name). Checked-out versions are not copied.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn copy_node(
        &self,
        node_id: NodeId,
        target_parent: NodeId,
        new_name: Option<&str>,
        cancel: &CancellationSignal,
    ) -> RepositoryResult<Vec<NodeRecord>> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let node = self.load_node(node_id).await?;
        let target = self.load_node(target_parent).await?;
        self.require_permission(node_id, Permission::Open).await?;
        self.require_permission(target_parent, Permission::AddNew).await?;

        if target.path.is_within(&node.path) {
            return Err(RepositoryError::InvalidOperation(format!(
                "cannot copy {} into itself ({})",
                node.path, target.path
            )));
        }
        let name = new_name.unwrap_or(node.name.as_str());
        let destination = target.path.join(name)?;

        let created = self
            .locks
            .run_locked(&[node.path.clone(), destination.clone()], cancel, async {
                self.ensure_unmoved(&[&node, &target]).await?;
                self.store.copy_subtree(node_id, target_parent, name).await.map_err(RepositoryError::from)
            })
            .await?;

        self.announce(&created, InvalidationReason::Copied).await;
        info!("Copied {} to {} ({} node(s))", node.path, destination, created.len());
        Ok(created)
    }

    /// Delete a subtree with every version of every node in it.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn delete_node(&self, node_id: NodeId, cancel: &CancellationSignal) -> RepositoryResult<Vec<NodeRecord>> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let node = self.load_node(node_id).await?;
        self.require_permission(node_id, Permission::Delete).await?;

        let deleted = self
            .locks
            .run_locked(std::slice::from_ref(&node.path), cancel, async {
                self.ensure_unmoved(&[&node]).await?;
                self.store.delete_subtree(node_id).await.map_err(RepositoryError::from)
            })
            .await?;

        self.announce(&deleted, InvalidationReason::Deleted).await;
        info!("Deleted {} ({} node(s))", node.path, deleted.len());
        Ok(deleted)
    }

    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn rename_node(
        &self,
        node_id: NodeId,
        new_name: &str,
        cancel: &CancellationSignal,
    ) -> RepositoryResult<Vec<NodeRecord>> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let node = self.load_node(node_id).await?;
        self.require_permission(node_id, Permission::Save).await?;
        let Some(parent_id) = node.parent_id else {
            return Err(RepositoryError::InvalidOperation(format!(
                "cannot rename root node {}",
                node.path
            )));
        };
        let destination = node
            .path
            .parent()
            .ok_or_else(|| RepositoryError::InvalidOperation(format!("{} has no parent path", node.path)))?
            .join(new_name)?;

        let renamed = self
            .locks
            .run_locked(&[node.path.clone(), destination.clone()], cancel, async {
                self.ensure_unmoved(&[&node]).await?;
                self.store.move_subtree(node_id, parent_id, new_name).await.map_err(RepositoryError::from)
            })
            .await?;

        self.announce(&renamed, InvalidationReason::Renamed).await;
        info!("Renamed {} to {}", node.path, destination);
        Ok(renamed)
    }
}
