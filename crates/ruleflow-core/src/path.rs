//! Resource paths
//!
//! Provides [`ResourcePath`] for addressing documents, links and metadata in
//! the resource store.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Segment reserved for the per-resource metadata sub-tree
pub const META_SEGMENT: &str = "_meta";

/// Slash-separated path in the resource store
///
/// Hierarchical structure of string segments. Leading, trailing and repeated
/// slashes are ignored when parsing.
///
/// # Examples
/// - `["bookmarks", "docs"]` → `/bookmarks/docs`
/// - `["resources", "abc", "_meta"]` → `/resources/abc/_meta`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ResourcePath(Vec<String>);

impl ResourcePath {
    /// Create new path from segments
    #[inline]
    #[must_use]
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Create path from a single segment
    #[inline]
    #[must_use]
    pub fn single(segment: impl Into<String>) -> Self {
        Self(vec![segment.into()])
    }

    /// Empty path (root)
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Get number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is empty (root)
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get parent path (if not root)
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Get last segment (if not root)
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Get first segment (if not root)
    #[inline]
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Append a segment, returning new path
    #[inline]
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut new = self.clone();
        new.0.push(segment.into());
        new
    }

    /// Append all segments of `other`, returning new path
    #[inline]
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        let mut new = self.clone();
        new.0.extend(other.0.iter().cloned());
        new
    }

    /// Path of this resource's metadata sub-tree
    #[inline]
    #[must_use]
    pub fn meta(&self) -> Self {
        self.child(META_SEGMENT)
    }

    /// Check if this path is a prefix of another
    #[inline]
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0 == other.0[..self.0.len()]
    }

    /// Get relative path from ancestor
    ///
    /// # Errors
    /// Returns error if `self` is not a descendant of `ancestor`
    pub fn relative_to(&self, ancestor: &Self) -> Result<Self, PathError> {
        if !ancestor.is_prefix_of(self) {
            return Err(PathError::NotDescendant {
                path: self.to_string(),
                ancestor: ancestor.to_string(),
            });
        }
        Ok(Self(self.0[ancestor.0.len()..].to_vec()))
    }

    /// Iterator over segments from root to leaf
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl FromStr for ResourcePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(|seg| {
                if seg == "." || seg == ".." {
                    Err(PathError::RelativeSegment(seg.to_string()))
                } else if seg.chars().any(char::is_control) {
                    Err(PathError::InvalidSegment(seg.to_string()))
                } else {
                    Ok(seg.to_string())
                }
            })
            .collect::<Result<_, _>>()?;

        Ok(Self(segments))
    }
}

impl From<Vec<String>> for ResourcePath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl Serialize for ResourcePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourcePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors related to resource paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// `.` or `..` segment
    #[error("relative segment '{0}' is not allowed in resource paths")]
    RelativeSegment(String),

    /// Invalid segment characters
    #[error("invalid segment: {0:?}")]
    InvalidSegment(String),

    /// Not a descendant path
    #[error("path '{path}' is not a descendant of '{ancestor}'")]
    NotDescendant { path: String, ancestor: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parse_ignores_redundant_slashes() {
        let path: ResourcePath = "//bookmarks/docs/".parse().unwrap();
        assert_eq!(path.segments(), &["bookmarks", "docs"]);
        assert_eq!(path.to_string(), "/bookmarks/docs");
    }

    #[test]
    fn path_root_display() {
        let path = ResourcePath::root();
        assert!(path.is_empty());
        assert_eq!(path.to_string(), "/");
        assert_eq!("/".parse::<ResourcePath>().unwrap(), path);
    }

    #[test]
    fn path_rejects_dot_segments() {
        let result: Result<ResourcePath, _> = "/a/../b".parse();
        assert!(matches!(result, Err(PathError::RelativeSegment(_))));
    }

    #[test]
    fn path_parent_and_last() {
        let path: ResourcePath = "/out/bar/x1".parse().unwrap();
        assert_eq!(path.last(), Some("x1"));
        assert_eq!(path.first(), Some("out"));
        assert_eq!(path.parent().unwrap().to_string(), "/out/bar");
        assert!(ResourcePath::root().parent().is_none());
    }

    #[test]
    fn path_child_join_and_meta() {
        let base: ResourcePath = "/resources/abc".parse().unwrap();
        let marker = base
            .meta()
            .join(&"services/ruleflow/rules".parse().unwrap())
            .child("r1");
        assert_eq!(
            marker.to_string(),
            "/resources/abc/_meta/services/ruleflow/rules/r1"
        );
    }

    #[test]
    fn path_relative_to() {
        let full: ResourcePath = "/a/b/c/d".parse().unwrap();
        let ancestor: ResourcePath = "/a/b".parse().unwrap();
        assert_eq!(full.relative_to(&ancestor).unwrap().segments(), &["c", "d"]);

        let other: ResourcePath = "/x".parse().unwrap();
        assert!(matches!(
            full.relative_to(&other),
            Err(PathError::NotDescendant { .. })
        ));
    }

    #[test]
    fn path_serde_as_string() {
        let path: ResourcePath = "/a/b".parse().unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"/a/b\"");
        let back: ResourcePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
