//! Per-node versioning and approval policy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Effective versioning mode seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningMode {
    #[default]
    None,
    MajorOnly,
    MajorAndMinor,
}

/// Effective approval requirement seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovingMode {
    #[default]
    False,
    True,
}

impl ApprovingMode {
    pub fn is_required(&self) -> bool {
        matches!(self, ApprovingMode::True)
    }
}

impl From<bool> for ApprovingMode {
    fn from(value: bool) -> Self {
        if value {
            ApprovingMode::True
        } else {
            ApprovingMode::False
        }
    }
}

/// Configured versioning of a node; `Inherited` takes the parent's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersioningSetting {
    #[default]
    Inherited,
    None,
    MajorOnly,
    MajorAndMinor,
}

impl VersioningSetting {
    pub fn explicit(&self) -> Option<VersioningMode> {
        match self {
            VersioningSetting::Inherited => None,
            VersioningSetting::None => Some(VersioningMode::None),
            VersioningSetting::MajorOnly => Some(VersioningMode::MajorOnly),
            VersioningSetting::MajorAndMinor => Some(VersioningMode::MajorAndMinor),
        }
    }
}

impl From<VersioningMode> for VersioningSetting {
    fn from(mode: VersioningMode) -> Self {
        match mode {
            VersioningMode::None => VersioningSetting::None,
            VersioningMode::MajorOnly => VersioningSetting::MajorOnly,
            VersioningMode::MajorAndMinor => VersioningSetting::MajorAndMinor,
        }
    }
}

/// Configured approval requirement; `Inherited` takes the parent's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovingSetting {
    #[default]
    Inherited,
    True,
    False,
}

impl ApprovingSetting {
    pub fn explicit(&self) -> Option<ApprovingMode> {
        match self {
            ApprovingSetting::Inherited => None,
            ApprovingSetting::True => Some(ApprovingMode::True),
            ApprovingSetting::False => Some(ApprovingMode::False),
        }
    }
}

impl From<ApprovingMode> for ApprovingSetting {
    fn from(mode: ApprovingMode) -> Self {
        match mode {
            ApprovingMode::True => ApprovingSetting::True,
            ApprovingMode::False => ApprovingSetting::False,
        }
    }
}

/// Fully resolved policy handed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionPolicy {
    pub versioning: VersioningMode,
    pub approving: ApprovingMode,
}

impl VersionPolicy {
    pub const fn new(versioning: VersioningMode, approving: ApprovingMode) -> Self {
        Self {
            versioning,
            approving,
        }
    }

    /// Resolve settings from the node itself up to the root.
    ///
    /// `chain` yields `(versioning, approving)` pairs starting at the node;
    /// the first explicit value of each wins. Unresolved values fall back to
    /// the defaults (`None`, `False`).
    pub fn resolve<I>(chain: I) -> Self
    where
        I: IntoIterator<Item = (VersioningSetting, ApprovingSetting)>,
    {
        let mut versioning = None;
        let mut approving = None;
        for (v, a) in chain {
            versioning = versioning.or(v.explicit());
            approving = approving.or(a.explicit());
            if versioning.is_some() && approving.is_some() {
                break;
            }
        }
        Self {
            versioning: versioning.unwrap_or_default(),
            approving: approving.unwrap_or_default(),
        }
    }
}

impl fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/approving={}",
            self.versioning,
            self.approving.is_required()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_takes_first_explicit_value() {
        let policy = VersionPolicy::resolve([
            (VersioningSetting::Inherited, ApprovingSetting::True),
            (VersioningSetting::MajorAndMinor, ApprovingSetting::False),
            (VersioningSetting::MajorOnly, ApprovingSetting::Inherited),
        ]);
        assert_eq!(policy.versioning, VersioningMode::MajorAndMinor);
        assert_eq!(policy.approving, ApprovingMode::True);
    }

    #[test]
    fn test_resolve_defaults_at_root() {
        let policy = VersionPolicy::resolve([(VersioningSetting::Inherited, ApprovingSetting::Inherited)]);
        assert_eq!(policy, VersionPolicy::default());
        assert_eq!(policy.versioning, VersioningMode::None);
        assert!(!policy.approving.is_required());
    }
}
