//! Per-node version history.
//!
//! The history is an arena: versions are kept in insertion order, which is
//! the authoritative chronological order (numbers can be reused after a
//! collapse, insertion positions cannot). Versions are addressed by
//! [`VersionId`], never by reference.

use serde::{Deserialize, Serialize};

use crate::error::VersionError;
use crate::head::NodeId;
use crate::version::{Properties, Version, VersionId, VersionNumber, VersionStatus};

/// A storage intent produced by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionChange {
    Insert { version: Version },
    UpdateStatus { id: VersionId, status: VersionStatus },
    UpdateProperties { id: VersionId, properties: Properties },
    Delete { id: VersionId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionHistory {
    node_id: NodeId,
    versions: Vec<Version>,
    next_seq: u32,
    revision: u64,
}

impl VersionHistory {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            versions: Vec::new(),
            next_seq: 1,
            revision: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Store revision this history was loaded at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Called by stores after a successful commit.
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Id the next inserted version will receive.
    pub fn next_id(&self) -> VersionId {
        VersionId::new(self.node_id, self.next_seq)
    }

    pub fn get(&self, id: VersionId) -> Option<&Version> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn find_number(&self, number: VersionNumber) -> Option<&Version> {
        self.versions.iter().find(|v| v.number == number)
    }

    /// The single `Locked` version, if the node is checked out.
    pub fn locked(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.status == VersionStatus::Locked)
    }

    /// Latest version reachable for editing; rejected versions never qualify.
    pub fn head(&self) -> Option<&Version> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.status != VersionStatus::Rejected)
    }

    /// Latest non-rejected version other than the locked one.
    pub fn head_before_lock(&self) -> Option<&Version> {
        self.versions
            .iter()
            .rev()
            .find(|v| !matches!(v.status, VersionStatus::Rejected | VersionStatus::Locked))
    }

    /// Latest `Approved` version.
    pub fn last_major(&self) -> Option<&Version> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.status == VersionStatus::Approved)
    }

    pub fn latest_with_status(&self, status: VersionStatus) -> Option<&Version> {
        self.versions.iter().rev().find(|v| v.status == status)
    }

    pub fn highest_number(&self) -> Option<VersionNumber> {
        self.versions.iter().map(|v| v.number).max()
    }

    /// `"V1.0.A,V2.0.L"`, in history order.
    pub fn summary(&self) -> String {
        self.versions
            .iter()
            .map(Version::label)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Apply a list of changes, all or nothing.
    pub fn apply_all(&mut self, changes: &[VersionChange]) -> Result<(), VersionError> {
        let mut staged = self.clone();
        for change in changes {
            staged.apply(change)?;
        }
        *self = staged;
        Ok(())
    }

    /// Apply one change, checking the history invariants.
    pub fn apply(&mut self, change: &VersionChange) -> Result<(), VersionError> {
        match change {
            VersionChange::Insert { version } => {
                if version.id.node_id != self.node_id {
                    return Err(self.violation(format!(
                        "version {} belongs to another node",
                        version.id
                    )));
                }
                if self.get(version.id).is_some() || version.id.seq < self.next_seq {
                    return Err(self.violation(format!("version id {} already used", version.id)));
                }
                if self.find_number(version.number).is_some() {
                    return Err(self.violation(format!("duplicate version number {}", version.number)));
                }
                if version.status == VersionStatus::Locked {
                    self.ensure_unlocked()?;
                }
                self.next_seq = version.id.seq + 1;
                self.versions.push(version.clone());
            }
            VersionChange::UpdateStatus { id, status } => {
                if *status == VersionStatus::Locked
                    && self.locked().is_some_and(|locked| locked.id != *id)
                {
                    self.ensure_unlocked()?;
                }
                let version = self.get_mut(*id)?;
                version.status = *status;
                if *status != VersionStatus::Locked {
                    version.locked_by = None;
                }
            }
            VersionChange::UpdateProperties { id, properties } => {
                self.get_mut(*id)?.properties = properties.clone();
            }
            VersionChange::Delete { id } => {
                let pos = self
                    .versions
                    .iter()
                    .position(|v| v.id == *id)
                    .ok_or_else(|| self.violation(format!("version {} does not exist", id)))?;
                self.versions.remove(pos);
            }
        }
        Ok(())
    }

    fn get_mut(&mut self, id: VersionId) -> Result<&mut Version, VersionError> {
        let node_id = self.node_id;
        self.versions
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| VersionError::InvariantViolation {
                node_id,
                reason: format!("version {} does not exist", id),
            })
    }

    fn ensure_unlocked(&self) -> Result<(), VersionError> {
        match self.locked() {
            Some(locked) => Err(self.violation(format!(
                "second locked version while {} is locked",
                locked.number
            ))),
            None => Ok(()),
        }
    }

    fn violation(&self, reason: String) -> VersionError {
        VersionError::InvariantViolation {
            node_id: self.node_id,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn version(history: &VersionHistory, major: u32, minor: u32, status: VersionStatus) -> Version {
        Version {
            id: history.next_id(),
            number: VersionNumber::new(major, minor),
            status,
            created_at: Utc::now(),
            locked_by: None,
            properties: Properties::new(),
        }
    }

    fn insert(history: &mut VersionHistory, major: u32, minor: u32, status: VersionStatus) -> VersionId {
        let v = version(history, major, minor, status);
        let id = v.id;
        history.apply(&VersionChange::Insert { version: v }).unwrap();
        id
    }

    #[test]
    fn test_head_skips_rejected() {
        let mut history = VersionHistory::new(NodeId(1));
        let v1 = insert(&mut history, 1, 0, VersionStatus::Approved);
        let v2 = insert(&mut history, 2, 0, VersionStatus::Rejected);
        assert_eq!(history.head().map(|v| v.id), Some(v1));
        assert_eq!(history.last_major().map(|v| v.id), Some(v1));
        assert_eq!(history.highest_number(), Some(VersionNumber::new(2, 0)));
        assert!(history.get(v2).is_some());
        assert_eq!(history.summary(), "V1.0.A,V2.0.R");
    }

    #[test]
    fn test_rejects_second_locked_version() {
        let mut history = VersionHistory::new(NodeId(1));
        insert(&mut history, 1, 0, VersionStatus::Locked);
        let second = version(&history, 2, 0, VersionStatus::Locked);
        let err = history.apply(&VersionChange::Insert { version: second }).unwrap_err();
        assert!(matches!(err, VersionError::InvariantViolation { .. }));
    }

    #[test]
    fn test_rejects_duplicate_number() {
        let mut history = VersionHistory::new(NodeId(1));
        insert(&mut history, 1, 0, VersionStatus::Approved);
        let dup = version(&history, 1, 0, VersionStatus::Draft);
        assert!(history.apply(&VersionChange::Insert { version: dup }).is_err());
    }

    #[test]
    fn test_apply_all_is_atomic() {
        let mut history = VersionHistory::new(NodeId(1));
        let v1 = insert(&mut history, 1, 0, VersionStatus::Approved);
        let before = history.clone();

        let changes = vec![
            VersionChange::UpdateStatus {
                id: v1,
                status: VersionStatus::Rejected,
            },
            VersionChange::Delete {
                id: VersionId::new(NodeId(1), 99),
            },
        ];
        assert!(history.apply_all(&changes).is_err());
        assert_eq!(history, before);
    }

    #[test]
    fn test_seq_never_reused() {
        let mut history = VersionHistory::new(NodeId(1));
        insert(&mut history, 1, 0, VersionStatus::Approved);
        let locked = insert(&mut history, 2, 0, VersionStatus::Locked);
        history.apply(&VersionChange::Delete { id: locked }).unwrap();
        let again = insert(&mut history, 2, 0, VersionStatus::Locked);
        assert_ne!(locked, again);
        assert_eq!(again.seq, locked.seq + 1);
    }

    #[test]
    fn test_leaving_locked_clears_owner() {
        let mut history = VersionHistory::new(NodeId(1));
        let mut v = version(&history, 1, 0, VersionStatus::Locked);
        v.locked_by = Some("alice".to_string());
        let id = v.id;
        history.apply(&VersionChange::Insert { version: v }).unwrap();
        history
            .apply(&VersionChange::UpdateStatus {
                id,
                status: VersionStatus::Approved,
            })
            .unwrap();
        assert_eq!(history.get(id).unwrap().locked_by, None);
    }
}
