use async_trait::async_trait;
use dashmap::DashMap;
use nodevault_core::{NodeId, Permission, PermissionChecker, StorageError};

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn has_permission(&self, _node_id: NodeId, _permission: Permission) -> Result<bool, StorageError> {
        Ok(true)
    }
}

/// Explicit deny entries on top of a default grant.
///
/// Entries apply to a single node, not its subtree: inheritance belongs to
/// the real permission engine.
#[derive(Debug, Default)]
pub struct PermissionTable {
    denied: DashMap<(NodeId, Permission), ()>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, node_id: NodeId, permission: Permission) {
        self.denied.insert((node_id, permission), ());
    }

    pub fn allow(&self, node_id: NodeId, permission: Permission) {
        self.denied.remove(&(node_id, permission));
    }
}

#[async_trait]
impl PermissionChecker for PermissionTable {
    async fn has_permission(&self, node_id: NodeId, permission: Permission) -> Result<bool, StorageError> {
        Ok(!self.denied.contains_key(&(node_id, permission)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deny_and_allow() {
        let table = PermissionTable::new();
        assert!(table.has_permission(NodeId(1), Permission::Delete).await.unwrap());

        table.deny(NodeId(1), Permission::Delete);
        assert!(!table.has_permission(NodeId(1), Permission::Delete).await.unwrap());
        assert!(table.has_permission(NodeId(1), Permission::Save).await.unwrap());
        assert!(table.has_permission(NodeId(2), Permission::Delete).await.unwrap());

        table.allow(NodeId(1), Permission::Delete);
        assert!(table.has_permission(NodeId(1), Permission::Delete).await.unwrap());
    }
}
