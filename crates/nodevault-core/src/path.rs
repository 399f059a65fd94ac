//! Repository paths.
//!
//! Paths are absolute, `/`-separated and compared ASCII case-insensitively.
//! Every ancestor/descendant test works on whole segments, so `/Root/A/B`
//! is not an ancestor of `/Root/A/BB`.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SEPARATOR: char = '/';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path must start with '/': {0}")]
    NotAbsolute(String),

    #[error("path has an empty segment: {0}")]
    EmptySegment(String),

    #[error("invalid node name: {0:?}")]
    InvalidName(String),
}

/// An absolute repository path such as `/Root/Sites/Default`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryPath(String);

impl RepositoryPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }
        if !path.starts_with(SEPARATOR) {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        if path[1..].split(SEPARATOR).any(str::is_empty) {
            return Err(PathError::EmptySegment(path.to_string()));
        }
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split(SEPARATOR)
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Last segment.
    pub fn name(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or_default()
    }

    pub fn parent(&self) -> Option<RepositoryPath> {
        let idx = self.0.rfind(SEPARATOR)?;
        if idx == 0 {
            return None;
        }
        Some(Self(self.0[..idx].to_string()))
    }

    pub fn join(&self, name: &str) -> Result<RepositoryPath, PathError> {
        validate_name(name)?;
        Ok(Self(format!("{}{}{}", self.0, SEPARATOR, name)))
    }

    /// `self` is a proper ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &RepositoryPath) -> bool {
        let (a, b) = (self.0.as_bytes(), other.0.as_bytes());
        b.len() > a.len()
            && b[a.len()] == SEPARATOR as u8
            && b[..a.len()].eq_ignore_ascii_case(a)
    }

    /// `self` is a proper descendant of `other`.
    pub fn is_descendant_of(&self, other: &RepositoryPath) -> bool {
        other.is_ancestor_of(self)
    }

    /// `self` is `other` or one of its descendants.
    pub fn is_within(&self, other: &RepositoryPath) -> bool {
        self == other || self.is_descendant_of(other)
    }

    /// Equal, ancestor or descendant.
    pub fn overlaps(&self, other: &RepositoryPath) -> bool {
        self == other || self.is_ancestor_of(other) || other.is_ancestor_of(self)
    }

    /// Replace the `from` prefix of this path with `to`.
    ///
    /// Returns `None` if this path is not within `from`.
    pub fn rebase(&self, from: &RepositoryPath, to: &RepositoryPath) -> Option<RepositoryPath> {
        if !self.is_within(from) {
            return None;
        }
        Some(Self(format!("{}{}", to.0, &self.0[from.0.len()..])))
    }
}

/// Check that `name` can be used as a single path segment.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() || name.contains(SEPARATOR) || name.trim() != name {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl PartialEq for RepositoryPath {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for RepositoryPath {}

impl Hash for RepositoryPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for RepositoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RepositoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryPath({:?})", self.0)
    }
}

impl TryFrom<String> for RepositoryPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RepositoryPath> for String {
    fn from(value: RepositoryPath) -> Self {
        value.0
    }
}

impl std::str::FromStr for RepositoryPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> RepositoryPath {
        RepositoryPath::parse(s).unwrap()
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(RepositoryPath::parse(""), Err(PathError::Empty));
        assert!(matches!(RepositoryPath::parse("Root/A"), Err(PathError::NotAbsolute(_))));
        assert!(matches!(RepositoryPath::parse("/Root//A"), Err(PathError::EmptySegment(_))));
        assert!(matches!(RepositoryPath::parse("/Root/"), Err(PathError::EmptySegment(_))));
        assert!(matches!(RepositoryPath::parse("/"), Err(PathError::EmptySegment(_))));
    }

    #[test]
    fn test_parent_and_name() {
        let path = p("/Root/A/B");
        assert_eq!(path.name(), "B");
        assert_eq!(path.parent(), Some(p("/Root/A")));
        assert_eq!(p("/Root").parent(), None);
        assert_eq!(path.depth(), 3);
        assert_eq!(p("/Root").join("X").unwrap(), p("/Root/X"));
        assert!(p("/Root").join("a/b").is_err());
    }

    #[test]
    fn test_segment_boundaries() {
        assert!(p("/Root/A").is_ancestor_of(&p("/Root/A/B")));
        assert!(!p("/Root/A/B").is_ancestor_of(&p("/Root/A/BB")));
        assert!(!p("/Root/A/B").is_ancestor_of(&p("/Root/A/B")));
        assert!(p("/Root/A/B/C").is_descendant_of(&p("/Root")));
        assert!(!p("/Root/A/B_B").overlaps(&p("/Root/A/B")));
        assert!(!p("/Root/A/BxB").overlaps(&p("/Root/A/B_B")));
        assert!(p("/Root/A").overlaps(&p("/Root/A")));
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(p("/Root/Folder"), p("/root/FOLDER"));
        assert!(p("/ROOT").is_ancestor_of(&p("/Root/x")));
    }

    #[test]
    fn test_rebase() {
        let moved = p("/Root/A/B/C").rebase(&p("/Root/A"), &p("/Root/X/A")).unwrap();
        assert_eq!(moved.as_str(), "/Root/X/A/B/C");
        assert_eq!(p("/Root/A").rebase(&p("/Root/A"), &p("/Root/Z")).unwrap(), p("/Root/Z"));
        assert!(p("/Root/AB").rebase(&p("/Root/A"), &p("/Root/Z")).is_none());
    }

    #[test]
    fn test_serde_validates() {
        let ok: RepositoryPath = serde_json::from_str("\"/Root/A\"").unwrap();
        assert_eq!(ok, p("/Root/A"));
        assert!(serde_json::from_str::<RepositoryPath>("\"Root\"").is_err());
    }
}
