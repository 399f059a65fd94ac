use async_trait::async_trait;

use crate::error::StorageError;
use crate::head::{NewNode, NodeHead, NodeId, NodeRecord};
use crate::history::{VersionChange, VersionHistory};
use crate::path::RepositoryPath;
use crate::version::{Version, VersionId};

/// Durable storage of nodes, version rows and node heads.
///
/// Every method is one transaction: it either fully applies or leaves the
/// store untouched. Implementations must be shareable across tasks and
/// visible to every process that shares the repository.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory").
    fn backend_name(&self) -> &'static str;

    // =========================================================================
    // Node Operations
    // =========================================================================

    /// Create a node with an empty history. Fails if the target path exists.
    async fn create_node(&self, node: NewNode) -> Result<NodeRecord, StorageError>;

    async fn load_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>, StorageError>;

    async fn load_node_by_path(
        &self,
        path: &RepositoryPath,
    ) -> Result<Option<NodeRecord>, StorageError>;

    /// Direct children of a node, in creation order.
    async fn load_children(&self, node_id: NodeId) -> Result<Vec<NodeRecord>, StorageError>;

    // =========================================================================
    // Head and Version Operations
    // =========================================================================

    async fn load_node_head(&self, node_id: NodeId) -> Result<Option<NodeHead>, StorageError>;

    /// Heads of the nodes that still exist, in request order.
    async fn load_node_heads(&self, node_ids: &[NodeId]) -> Result<Vec<NodeHead>, StorageError>;

    async fn load_history(&self, node_id: NodeId) -> Result<Option<VersionHistory>, StorageError>;

    /// Load one version row; `None` if it (or its node) no longer exists.
    async fn load_version(&self, version_id: VersionId) -> Result<Option<Version>, StorageError>;

    /// Load the version rows that still exist, in request order.
    async fn load_versions(&self, version_ids: &[VersionId]) -> Result<Vec<Version>, StorageError>;

    /// Apply version changes atomically.
    ///
    /// Fails with [`StorageError::Conflict`] when the node's history is no
    /// longer at `expected_revision` (check-and-set), and with
    /// [`StorageError::InvalidArgument`] when the changes break a history
    /// invariant. Returns the head rebuilt from the committed history.
    async fn commit_versions(
        &self,
        node_id: NodeId,
        expected_revision: u64,
        changes: &[VersionChange],
    ) -> Result<NodeHead, StorageError>;

    // =========================================================================
    // Structural Operations
    // =========================================================================

    /// Move a subtree under `new_parent` as `new_name` (a rename when the
    /// parent does not change). Returns the moved records with new paths.
    async fn move_subtree(
        &self,
        node_id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<Vec<NodeRecord>, StorageError>;

    /// Copy a subtree under `target_parent` as `new_name`. Checked-out
    /// versions are not copied. Returns the created records, root first.
    async fn copy_subtree(
        &self,
        node_id: NodeId,
        target_parent: NodeId,
        new_name: &str,
    ) -> Result<Vec<NodeRecord>, StorageError>;

    /// Delete a subtree with all histories. Returns the deleted records.
    async fn delete_subtree(&self, node_id: NodeId) -> Result<Vec<NodeRecord>, StorageError>;
}
