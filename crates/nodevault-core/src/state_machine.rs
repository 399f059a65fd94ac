//! The version lifecycle state machine.
//!
//! [`transition`] is pure: given a history, an operation and the node's
//! resolved policy it returns the next history plus the storage intents
//! that produce it. It never touches storage and never suspends.
//!
//! Number allocation is always one step ahead of the highest number present
//! in the history, so a retained rejected version's number is never handed
//! out twice. Whether the step is a major or a minor one depends on the
//! versioning mode and on the head's status.

use chrono::{DateTime, Utc};

use crate::error::VersionError;
use crate::history::{VersionChange, VersionHistory};
use crate::policy::{VersionPolicy, VersioningMode};
use crate::version::{OperationKind, Properties, Version, VersionId, VersionNumber, VersionOperation, VersionStatus};

/// Side effects of a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionEffect {
    /// Storage intents, in application order.
    pub changes: Vec<VersionChange>,
    pub created: Option<VersionId>,
    pub removed: Vec<VersionId>,
    /// Draft/rejected versions made unreachable by a major approval.
    pub superseded: Vec<VersionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub history: VersionHistory,
    pub effect: TransitionEffect,
}

/// Compute the result of `operation` on `history` under `policy`.
pub fn transition(
    history: &VersionHistory,
    operation: &VersionOperation,
    policy: VersionPolicy,
    now: DateTime<Utc>,
) -> Result<Transition, VersionError> {
    let mut step = Step {
        history: history.clone(),
        effect: TransitionEffect::default(),
        operation: operation.kind(),
        now,
    };

    match operation {
        VersionOperation::Save { properties } => step.save(properties, policy)?,
        VersionOperation::CheckOut { owner } => step.check_out(owner, policy)?,
        VersionOperation::CheckIn => step.check_in(policy)?,
        VersionOperation::UndoCheckOut => step.undo_check_out()?,
        VersionOperation::Publish => step.publish(policy)?,
        VersionOperation::Approve => step.approve()?,
        VersionOperation::Reject => step.reject()?,
    }

    Ok(Transition {
        history: step.history,
        effect: step.effect,
    })
}

/// Number the first version of a node receives.
pub fn initial_number(policy: VersionPolicy) -> VersionNumber {
    match (policy.versioning, policy.approving.is_required()) {
        (VersioningMode::MajorAndMinor, true) => VersionNumber::new(0, 1),
        _ => VersionNumber::new(1, 0),
    }
}

/// Status of a freshly saved (not checked-out) version.
fn saved_status(policy: VersionPolicy) -> VersionStatus {
    if !policy.approving.is_required() {
        return VersionStatus::Approved;
    }
    match policy.versioning {
        VersioningMode::MajorAndMinor => VersionStatus::Draft,
        // No draft stage without minor versions: straight into approval.
        VersioningMode::None | VersioningMode::MajorOnly => VersionStatus::Pending,
    }
}

/// Next number for a new version given the current history.
pub fn next_number(history: &VersionHistory, versioning: VersioningMode) -> VersionNumber {
    let top = history.highest_number().unwrap_or(VersionNumber::new(0, 0));
    match versioning {
        VersioningMode::None | VersioningMode::MajorOnly => top.next_major(),
        VersioningMode::MajorAndMinor => {
            let head_approved = history
                .head()
                .map_or(history.is_empty(), |head| head.status == VersionStatus::Approved);
            if head_approved {
                top.next_major()
            } else {
                top.next_minor()
            }
        }
    }
}

struct Step {
    history: VersionHistory,
    effect: TransitionEffect,
    operation: OperationKind,
    now: DateTime<Utc>,
}

impl Step {
    fn push(&mut self, change: VersionChange) -> Result<(), VersionError> {
        self.history.apply(&change)?;
        match &change {
            VersionChange::Insert { version } => self.effect.created = Some(version.id),
            VersionChange::Delete { id } => self.effect.removed.push(*id),
            _ => {}
        }
        self.effect.changes.push(change);
        Ok(())
    }

    fn insert(
        &mut self,
        number: VersionNumber,
        status: VersionStatus,
        properties: Properties,
        locked_by: Option<String>,
    ) -> Result<(), VersionError> {
        let version = Version {
            id: self.history.next_id(),
            number,
            status,
            created_at: self.now,
            locked_by,
            properties,
        };
        self.push(VersionChange::Insert { version })
    }

    fn set_status(&mut self, id: VersionId, status: VersionStatus) -> Result<(), VersionError> {
        self.push(VersionChange::UpdateStatus { id, status })
    }

    fn invalid(&self, expected: &'static str, found: Option<VersionStatus>) -> VersionError {
        VersionError::InvalidTransition {
            node_id: self.history.node_id(),
            operation: self.operation,
            expected,
            found,
        }
    }

    fn head_status(&self) -> Option<VersionStatus> {
        self.history.head().map(|v| v.status)
    }

    fn require_locked(&self) -> Result<Version, VersionError> {
        self.history
            .locked()
            .cloned()
            .ok_or_else(|| self.invalid("locked", self.head_status()))
    }

    fn save(&mut self, properties: &Properties, policy: VersionPolicy) -> Result<(), VersionError> {
        if let Some(locked) = self.history.locked() {
            let id = locked.id;
            return self.push(VersionChange::UpdateProperties {
                id,
                properties: properties.clone(),
            });
        }

        if self.history.is_empty() {
            let number = initial_number(policy);
            return self.insert(number, saved_status(policy), properties.clone(), None);
        }

        match (policy.versioning, self.history.head().map(|v| v.id)) {
            (VersioningMode::None, Some(id)) => self.push(VersionChange::UpdateProperties {
                id,
                properties: properties.clone(),
            }),
            // Versioned save, or every retained version was rejected.
            _ => {
                let number = next_number(&self.history, policy.versioning);
                self.insert(number, saved_status(policy), properties.clone(), None)
            }
        }
    }

    fn check_out(&mut self, owner: &str, policy: VersionPolicy) -> Result<(), VersionError> {
        if let Some(locked) = self.history.locked() {
            return Err(VersionError::VersionLocked {
                node_id: self.history.node_id(),
                version: locked.number,
                owner: locked.locked_by.clone(),
            });
        }
        let Some(head) = self.history.head() else {
            return Err(self.invalid("saved", None));
        };
        let properties = head.properties.clone();
        let number = next_number(&self.history, policy.versioning);
        self.insert(number, VersionStatus::Locked, properties, Some(owner.to_string()))
    }

    fn check_in(&mut self, policy: VersionPolicy) -> Result<(), VersionError> {
        let locked = self.require_locked()?;

        if policy.approving.is_required() {
            return self.set_status(locked.id, VersionStatus::Pending);
        }

        match policy.versioning {
            VersioningMode::None => match self.history.head_before_lock().map(|v| v.id) {
                // Collapse onto the single retained version.
                Some(previous) => {
                    self.push(VersionChange::UpdateProperties {
                        id: previous,
                        properties: locked.properties.clone(),
                    })?;
                    if self.history.get(previous).map(|v| v.status) != Some(VersionStatus::Approved) {
                        self.set_status(previous, VersionStatus::Approved)?;
                    }
                    self.push(VersionChange::Delete { id: locked.id })
                }
                None => self.set_status(locked.id, VersionStatus::Approved),
            },
            VersioningMode::MajorOnly => self.set_status(locked.id, VersionStatus::Approved),
            VersioningMode::MajorAndMinor => {
                let status = if locked.number.is_major() {
                    VersionStatus::Approved
                } else {
                    VersionStatus::Draft
                };
                self.set_status(locked.id, status)
            }
        }
    }

    fn undo_check_out(&mut self) -> Result<(), VersionError> {
        let locked = self.require_locked()?;
        self.push(VersionChange::Delete { id: locked.id })
    }

    fn publish(&mut self, policy: VersionPolicy) -> Result<(), VersionError> {
        let head = self.history.head().map(|v| (v.id, v.status));
        let allowed = policy.versioning == VersioningMode::MajorAndMinor && policy.approving.is_required();
        match head {
            Some((id, VersionStatus::Draft)) if allowed => self.set_status(id, VersionStatus::Pending),
            Some((_, status)) => Err(self.invalid("draft", Some(status))),
            None => Err(self.invalid("draft", None)),
        }
    }

    fn approve(&mut self) -> Result<(), VersionError> {
        let pending = self
            .history
            .latest_with_status(VersionStatus::Pending)
            .cloned()
            .ok_or_else(|| self.invalid("pending", self.head_status()))?;

        if pending.number.is_major() {
            let position = self
                .history
                .versions()
                .iter()
                .position(|v| v.id == pending.id)
                .unwrap_or_default();
            self.effect.superseded = self.history.versions()[..position]
                .iter()
                .filter(|v| matches!(v.status, VersionStatus::Draft | VersionStatus::Rejected))
                .map(|v| v.id)
                .collect();
        }
        self.set_status(pending.id, VersionStatus::Approved)
    }

    fn reject(&mut self) -> Result<(), VersionError> {
        let pending = self
            .history
            .latest_with_status(VersionStatus::Pending)
            .map(|v| v.id)
            .ok_or_else(|| self.invalid("pending", self.head_status()))?;
        self.set_status(pending, VersionStatus::Rejected)
    }
}
