use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::head::NodeId;

/// A `(major, minor)` version number, ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
}

impl VersionNumber {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// A major number denotes a milestone (`minor == 0`).
    pub fn is_major(&self) -> bool {
        self.minor == 0
    }

    pub fn next_major(&self) -> Self {
        Self::new(self.major + 1, 0)
    }

    pub fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1)
    }

    /// Compare two possibly absent numbers.
    ///
    /// An absent number is never a peer of anything, itself included:
    /// the result is `None` whenever either side is missing.
    pub fn compare(a: Option<&VersionNumber>, b: Option<&VersionNumber>) -> Option<Ordering> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Render with a status letter, e.g. `V1.0.A`.
    pub fn with_status(&self, status: VersionStatus) -> String {
        format!("V{}.{}.{}", self.major, self.minor, status.letter())
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}.{}", self.major, self.minor)
    }
}

/// Lifecycle status of a single version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Locked,
    Draft,
    Pending,
    Approved,
    Rejected,
}

impl VersionStatus {
    pub fn letter(&self) -> char {
        match self {
            VersionStatus::Locked => 'L',
            VersionStatus::Draft => 'D',
            VersionStatus::Pending => 'P',
            VersionStatus::Approved => 'A',
            VersionStatus::Rejected => 'R',
        }
    }

    /// Terminal statuses are retained in history forever.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VersionStatus::Approved | VersionStatus::Rejected)
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionStatus::Locked => write!(f, "locked"),
            VersionStatus::Draft => write!(f, "draft"),
            VersionStatus::Pending => write!(f, "pending"),
            VersionStatus::Approved => write!(f, "approved"),
            VersionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Arena index of a version inside its node's history.
///
/// `seq` is allocated once per history and never reused, so a version that
/// was deleted and whose number was later reallocated keeps a distinct id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId {
    pub node_id: NodeId,
    pub seq: u32,
}

impl VersionId {
    pub const fn new(node_id: NodeId, seq: u32) -> Self {
        Self { node_id, seq }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_id, self.seq)
    }
}

/// Opaque snapshot of a node's dynamic properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, serde_json::Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Builder-style `set`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

/// One entry of a version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub number: VersionNumber,
    pub status: VersionStatus,
    pub created_at: DateTime<Utc>,
    /// Holder of the checkout while `status == Locked`.
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl Version {
    pub fn label(&self) -> String {
        self.number.with_status(self.status)
    }
}

/// Lifecycle operations understood by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionOperation {
    Save { properties: Properties },
    CheckOut { owner: String },
    CheckIn,
    UndoCheckOut,
    Publish,
    Approve,
    Reject,
}

impl VersionOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            VersionOperation::Save { .. } => OperationKind::Save,
            VersionOperation::CheckOut { .. } => OperationKind::CheckOut,
            VersionOperation::CheckIn => OperationKind::CheckIn,
            VersionOperation::UndoCheckOut => OperationKind::UndoCheckOut,
            VersionOperation::Publish => OperationKind::Publish,
            VersionOperation::Approve => OperationKind::Approve,
            VersionOperation::Reject => OperationKind::Reject,
        }
    }
}

/// Payload-free discriminant of [`VersionOperation`], used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Save,
    CheckOut,
    CheckIn,
    UndoCheckOut,
    Publish,
    Approve,
    Reject,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Save => "save",
            OperationKind::CheckOut => "check-out",
            OperationKind::CheckIn => "check-in",
            OperationKind::UndoCheckOut => "undo check-out",
            OperationKind::Publish => "publish",
            OperationKind::Approve => "approve",
            OperationKind::Reject => "reject",
        };
        f.write_str(name)
    }
}
