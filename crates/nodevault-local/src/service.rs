//! Version lifecycle service.
//!
//! Every operation follows the same path: permission check, load the
//! history, resolve the policy, compute the transition, check the tree lock
//! table, then one check-and-set commit. Nothing is retried. A revision
//! conflict only triggers a reload to report the real cause, so a losing
//! concurrent check-out surfaces as `VersionLocked`.

use std::sync::Arc;

use chrono::Utc;
use nodevault_core::{
    transition, ClusterChannel, InvalidationReason, InvalidationSink, NewNode, NodeHead, NodeId, NodeRecord,
    OperationKind, Permission, PermissionChecker, Properties, RepositoryError, RepositoryResult, StorageError,
    VersionOperation, VersionPolicy, VersionStore,
};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationSignal;
use crate::lock::TreeLockRegistry;
use crate::notify::Notifier;

/// Permission a lifecycle operation requires on the node.
fn required_permission(kind: OperationKind) -> Permission {
    match kind {
        OperationKind::Save | OperationKind::CheckOut | OperationKind::CheckIn | OperationKind::UndoCheckOut => {
            Permission::Save
        }
        OperationKind::Publish => Permission::Publish,
        OperationKind::Approve | OperationKind::Reject => Permission::Approve,
    }
}

pub struct VersionService {
    store: Arc<dyn VersionStore>,
    locks: TreeLockRegistry,
    permissions: Arc<dyn PermissionChecker>,
    notifier: Notifier,
}

impl VersionService {
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

    pub fn store(&self) -> &Arc<dyn VersionStore> {
        &self.store
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

    /// Effective policy of a node, resolving `Inherited` up the parent chain.
    pub async fn policy(&self, node: &NodeRecord) -> RepositoryResult<VersionPolicy> {
        let mut chain = vec![(node.versioning, node.approving)];
        let mut parent_id = node.parent_id;
        while let Some(id) = parent_id {
            let resolved = chain.iter().any(|(v, _)| v.explicit().is_some())
                && chain.iter().any(|(_, a)| a.explicit().is_some());
            if resolved {
                break;
            }
            let parent = self.load_node(id).await?;
            chain.push((parent.versioning, parent.approving));
            parent_id = parent.parent_id;
        }
        Ok(VersionPolicy::resolve(chain))
    }

    /// Create an empty node. Its first `Save` creates the initial version.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn create_node(&self, node: NewNode, cancel: &CancellationSignal) -> RepositoryResult<NodeRecord> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        if let Some(parent_id) = node.parent_id {
            self.require_permission(parent_id, Permission::AddNew).await?;
            let parent = self.load_node(parent_id).await?;
            let target = parent.path.join(&node.name)?;
            self.locks.assert_free(&[target]).await?;
        }

        let record = self.store.create_node(node).await?;
        self.notifier.node_changed(record.id, &record.path, record.node_type_id, InvalidationReason::Created)
            .await;
        info!("Created {} (node {})", record.path, record.id);
        Ok(record)
    }

    pub async fn save(
        &self,
        node_id: NodeId,
        properties: Properties,
        cancel: &CancellationSignal,
    ) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::Save { properties }, cancel)
            .await
    }

    pub async fn check_out(
        &self,
        node_id: NodeId,
        owner: impl Into<String>,
        cancel: &CancellationSignal,
    ) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::CheckOut { owner: owner.into() }, cancel)
            .await
    }

    pub async fn check_in(&self, node_id: NodeId, cancel: &CancellationSignal) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::CheckIn, cancel).await
    }

    pub async fn undo_check_out(&self, node_id: NodeId, cancel: &CancellationSignal) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::UndoCheckOut, cancel)
            .await
    }

    pub async fn publish(&self, node_id: NodeId, cancel: &CancellationSignal) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::Publish, cancel).await
    }

    pub async fn approve(&self, node_id: NodeId, cancel: &CancellationSignal) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::Approve, cancel).await
    }

    pub async fn reject(&self, node_id: NodeId, cancel: &CancellationSignal) -> RepositoryResult<NodeHead> {
        self.execute(node_id, VersionOperation::Reject, cancel).await
    }

    /// Apply one lifecycle operation. Either the whole transition is
    /// committed or nothing is.
    #[instrument(skip(self, operation, cancel), level = "debug", fields(op = %operation.kind()))]
    pub async fn execute(
        &self,
        node_id: NodeId,
        operation: VersionOperation,
        cancel: &CancellationSignal,
    ) -> RepositoryResult<NodeHead> {
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }
        let kind = operation.kind();
        self.require_permission(node_id, required_permission(kind)).await?;

        let node = self.load_node(node_id).await?;
        let history = self
            .store
            .load_history(node_id)
            .await?
            .ok_or(RepositoryError::NodeNotFound(node_id))?;
        let policy = self.policy(&node).await?;

        let next = transition(&history, &operation, policy, Utc::now())?;
        debug!(
            "{} on {} under {}: {} change(s)",
            kind,
            node.path,
            policy,
            next.effect.changes.len()
        );

        self.locks.assert_free(&[node.path.clone()]).await?;
        if cancel.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }

        let head = match self
            .store
            .commit_versions(node_id, history.revision(), &next.effect.changes)
            .await
        {
            Ok(head) => head,
            Err(conflict @ StorageError::Conflict { .. }) => {
                return Err(self.classify_conflict(&node, &operation, policy, conflict).await);
            }
            Err(e) => return Err(e.into()),
        };

        if !next.effect.superseded.is_empty() {
            debug!("{} version(s) of {} superseded", next.effect.superseded.len(), node.path);
        }
        self.notifier.node_changed(node_id, &head.path, head.node_type_id, InvalidationReason::Version(kind))
            .await;
        info!("{} {} -> {}", kind, head.path, head.summary());
        Ok(head)
    }

    /// Report why a commit lost the race. The operation is replayed against
    /// the fresh history only to find an error; it is never committed.
    async fn classify_conflict(
        &self,
        node: &NodeRecord,
        operation: &VersionOperation,
        policy: VersionPolicy,
        conflict: StorageError,
    ) -> RepositoryError {
        debug!("Commit on {} lost a race: {}", node.path, conflict);
        match self.store.load_history(node.id).await {
            Ok(Some(fresh)) => match transition(&fresh, operation, policy, Utc::now()) {
                Err(e) => e.into(),
                Ok(_) => conflict.into(),
            },
            Ok(None) => RepositoryError::NodeNotFound(node.id),
            Err(e) => {
                warn!("Failed to reload history of {} after conflict: {}", node.path, e);
                conflict.into()
            }
        }
    }
}
