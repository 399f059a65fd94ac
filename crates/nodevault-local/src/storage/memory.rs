use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use nodevault_core::path::validate_name;
use nodevault_core::{
    NewNode, NodeHead, NodeId, NodeRecord, RepositoryPath, StorageError, Version, VersionChange,
    VersionHistory, VersionId, VersionStatus, VersionStore,
};
use tracing::{debug, instrument};

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<NodeId, NodeRecord>,
    histories: HashMap<NodeId, VersionHistory>,
    next_node_id: u64,
    /// Global commit counter, handed out as history revisions.
    next_revision: u64,
}

impl MemoryState {
    fn allocate_node_id(&mut self) -> NodeId {
        self.next_node_id += 1;
        NodeId(self.next_node_id)
    }

    fn allocate_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn node(&self, node_id: NodeId) -> Result<&NodeRecord, StorageError> {
        self.nodes
            .get(&node_id)
            .ok_or_else(|| StorageError::NotFound(format!("node {}", node_id)))
    }

    fn find_by_path(&self, path: &RepositoryPath) -> Option<&NodeRecord> {
        self.nodes.values().find(|n| &n.path == path)
    }

    fn ensure_path_free(&self, path: &RepositoryPath) -> Result<(), StorageError> {
        match self.find_by_path(path) {
            Some(existing) => Err(StorageError::InvalidArgument(format!(
                "{} already exists (node {})",
                path, existing.id
            ))),
            None => Ok(()),
        }
    }

    /// The node and all its descendants, shallowest first.
    fn subtree(&self, root: &NodeRecord) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .values()
            .filter(|n| n.path.is_within(&root.path))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.path.depth(), n.id));
        nodes
    }

    fn head(&self, node_id: NodeId) -> Option<NodeHead> {
        let node = self.nodes.get(&node_id)?;
        let history = self.histories.get(&node_id)?;
        Some(NodeHead::build(node, history))
    }

    fn version(&self, version_id: VersionId) -> Option<Version> {
        self.histories
            .get(&version_id.node_id)
            .and_then(|h| h.get(version_id))
            .cloned()
    }
}

/// In-memory version store.
///
/// Every operation runs under one mutex, which makes each call a
/// transaction. Visible to this process only.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    state: Mutex<MemoryState>,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    // =========================================================================
    // Node Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn create_node(&self, node: NewNode) -> Result<NodeRecord, StorageError> {
        validate_name(&node.name).map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        let mut state = self.state();

        let path = match node.parent_id {
            Some(parent_id) => state
                .node(parent_id)?
                .path
                .join(&node.name)
                .map_err(|e| StorageError::InvalidArgument(e.to_string()))?,
            None => RepositoryPath::parse(&format!("/{}", node.name))
                .map_err(|e| StorageError::InvalidArgument(e.to_string()))?,
        };
        state.ensure_path_free(&path)?;

        let id = state.allocate_node_id();
        let record = NodeRecord {
            id,
            parent_id: node.parent_id,
            name: node.name,
            path,
            node_type_id: node.node_type_id,
            versioning: node.versioning,
            approving: node.approving,
            created_at: Utc::now(),
        };
        let mut history = VersionHistory::new(id);
        history.set_revision(state.allocate_revision());

        state.nodes.insert(id, record.clone());
        state.histories.insert(id, history);
        debug!("Created node {} at {}", id, record.path);
        Ok(record)
    }

    async fn load_node(&self, node_id: NodeId) -> Result<Option<NodeRecord>, StorageError> {
        Ok(self.state().nodes.get(&node_id).cloned())
    }

    async fn load_node_by_path(&self, path: &RepositoryPath) -> Result<Option<NodeRecord>, StorageError> {
        Ok(self.state().find_by_path(path).cloned())
    }

    async fn load_children(&self, node_id: NodeId) -> Result<Vec<NodeRecord>, StorageError> {
        Ok(self
            .state()
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(node_id))
            .cloned()
            .collect())
    }

    // =========================================================================
    // Head and Version Operations
    // =========================================================================

    async fn load_node_head(&self, node_id: NodeId) -> Result<Option<NodeHead>, StorageError> {
        Ok(self.state().head(node_id))
    }

    async fn load_node_heads(&self, node_ids: &[NodeId]) -> Result<Vec<NodeHead>, StorageError> {
        let state = self.state();
        Ok(node_ids.iter().filter_map(|id| state.head(*id)).collect())
    }

    async fn load_history(&self, node_id: NodeId) -> Result<Option<VersionHistory>, StorageError> {
        Ok(self.state().histories.get(&node_id).cloned())
    }

    async fn load_version(&self, version_id: VersionId) -> Result<Option<Version>, StorageError> {
        Ok(self.state().version(version_id))
    }

    async fn load_versions(&self, version_ids: &[VersionId]) -> Result<Vec<Version>, StorageError> {
        let state = self.state();
        Ok(version_ids.iter().filter_map(|id| state.version(*id)).collect())
    }

    #[instrument(skip(self, changes), level = "debug", fields(changes = changes.len()))]
    async fn commit_versions(
        &self,
        node_id: NodeId,
        expected_revision: u64,
        changes: &[VersionChange],
    ) -> Result<NodeHead, StorageError> {
        let mut state = self.state();
        let revision = state.allocate_revision();

        let history = state
            .histories
            .get_mut(&node_id)
            .ok_or_else(|| StorageError::NotFound(format!("node {}", node_id)))?;
        if history.revision() != expected_revision {
            return Err(StorageError::Conflict {
                node_id,
                expected: expected_revision,
                actual: history.revision(),
            });
        }

        let mut staged = history.clone();
        staged
            .apply_all(changes)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        staged.set_revision(revision);
        *history = staged;

        debug!("Committed {} change(s) to node {} at revision {}", changes.len(), node_id, revision);
        state
            .head(node_id)
            .ok_or_else(|| StorageError::Internal(format!("node {} vanished during commit", node_id)))
    }

    // =========================================================================
    // Structural Operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    async fn move_subtree(
        &self,
        node_id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<Vec<NodeRecord>, StorageError> {
        validate_name(new_name).map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        let mut state = self.state();

        let root = state.node(node_id)?.clone();
        let parent = state.node(new_parent)?.clone();
        if parent.path.is_within(&root.path) {
            return Err(StorageError::InvalidArgument(format!(
                "cannot move {} under itself ({})",
                root.path, parent.path
            )));
        }
        let target = parent
            .path
            .join(new_name)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        if let Some(existing) = state.find_by_path(&target) {
            if existing.id != node_id {
                return Err(StorageError::InvalidArgument(format!("{} already exists", target)));
            }
        }

        let mut moved = Vec::new();
        for mut record in state.subtree(&root) {
            if let Some(path) = record.path.rebase(&root.path, &target) {
                record.path = path;
            }
            if record.id == node_id {
                record.parent_id = Some(new_parent);
                record.name = new_name.to_string();
            }
            state.nodes.insert(record.id, record.clone());
            moved.push(record);
        }

        debug!("Moved {} node(s) from {} to {}", moved.len(), root.path, target);
        Ok(moved)
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_subtree(
        &self,
        node_id: NodeId,
        target_parent: NodeId,
        new_name: &str,
    ) -> Result<Vec<NodeRecord>, StorageError> {
        validate_name(new_name).map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        let mut state = self.state();

        let root = state.node(node_id)?.clone();
        let parent = state.node(target_parent)?.clone();
        if parent.path.is_within(&root.path) {
            return Err(StorageError::InvalidArgument(format!(
                "cannot copy {} into itself ({})",
                root.path, parent.path
            )));
        }
        let target = parent
            .path
            .join(new_name)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        state.ensure_path_free(&target)?;

        let now = Utc::now();
        let mut new_ids: HashMap<NodeId, NodeId> = HashMap::new();
        let mut created = Vec::new();

        for source in state.subtree(&root) {
            let id = state.allocate_node_id();
            new_ids.insert(source.id, id);

            let path = source
                .path
                .rebase(&root.path, &target)
                .ok_or_else(|| StorageError::Internal(format!("{} is outside {}", source.path, root.path)))?;
            let (parent_id, name) = if source.id == node_id {
                (Some(target_parent), new_name.to_string())
            } else {
                (source.parent_id.and_then(|p| new_ids.get(&p).copied()), source.name.clone())
            };

            let mut history = VersionHistory::new(id);
            if let Some(source_history) = state.histories.get(&source.id) {
                let changes: Vec<VersionChange> = source_history
                    .versions()
                    .iter()
                    .filter(|v| v.status != VersionStatus::Locked)
                    .enumerate()
                    .map(|(i, v)| VersionChange::Insert {
                        version: Version {
                            id: VersionId::new(id, i as u32 + 1),
                            locked_by: None,
                            ..v.clone()
                        },
                    })
                    .collect();
                history
                    .apply_all(&changes)
                    .map_err(|e| StorageError::Internal(e.to_string()))?;
            }
            history.set_revision(state.allocate_revision());

            let record = NodeRecord {
                id,
                parent_id,
                name,
                path,
                node_type_id: source.node_type_id,
                versioning: source.versioning,
                approving: source.approving,
                created_at: now,
            };
            state.nodes.insert(id, record.clone());
            state.histories.insert(id, history);
            created.push(record);
        }

        debug!("Copied {} node(s) from {} to {}", created.len(), root.path, target);
        Ok(created)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_subtree(&self, node_id: NodeId) -> Result<Vec<NodeRecord>, StorageError> {
        let mut state = self.state();
        let root = state.node(node_id)?.clone();
        let deleted = state.subtree(&root);
        for record in &deleted {
            state.nodes.remove(&record.id);
            state.histories.remove(&record.id);
        }
        debug!("Deleted {} node(s) under {}", deleted.len(), root.path);
        Ok(deleted)
    }
}
