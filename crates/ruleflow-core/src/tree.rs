//! Structural hints
//!
//! [`Tree`] describes which levels of a path are standalone resources and
//! what content type they carry. [`ItemsPattern`] describes at which depth
//! below a watched list the items live.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Wildcard key used in trees and items patterns
pub const WILDCARD: &str = "*";

/// Shape of a resource hierarchy
///
/// A tree is a JSON object mirroring the path hierarchy. A level carrying a
/// `_type` key is materialised as its own resource with that content type;
/// a `_rev` key asks for a versioned link to it. The `*` key matches any
/// child.
///
/// ```
/// # use ruleflow_core::Tree;
/// # use serde_json::json;
/// let tree = Tree::new(json!({
///     "bookmarks": { "_type": "application/vnd.oada.bookmarks.1+json" }
/// }));
/// let level = tree.child("bookmarks").unwrap();
/// assert!(level.is_resource());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tree(Value);

impl Tree {
    /// Wrap a JSON tree
    #[inline]
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Empty tree (every level is a plain object)
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Underlying JSON
    #[inline]
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Sub-tree for a child segment (exact match first, then `*`)
    #[must_use]
    pub fn child(&self, segment: &str) -> Option<Tree> {
        let obj = self.0.as_object()?;
        obj.get(segment)
            .or_else(|| obj.get(WILDCARD))
            .filter(|v| v.is_object())
            .cloned()
            .map(Tree)
    }

    /// Sub-tree reached by following `segments`
    #[must_use]
    pub fn descend<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Option<Tree> {
        segments
            .into_iter()
            .try_fold(self.clone(), |tree, seg| tree.child(seg))
    }

    /// Content type of this level
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.0.get("_type").and_then(Value::as_str)
    }

    /// Whether this level is a standalone resource
    #[inline]
    #[must_use]
    pub fn is_resource(&self) -> bool {
        self.content_type().is_some()
    }

    /// Whether links to this level carry a `_rev`
    #[inline]
    #[must_use]
    pub fn is_versioned(&self) -> bool {
        self.0.get("_rev").is_some()
    }
}

/// Pattern locating items below a watched list
///
/// Slash-separated segments, each either `*` (any key) or a literal key.
/// The default pattern `*` means "direct children".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemsPattern(Vec<String>);

impl ItemsPattern {
    /// Direct children of the list
    #[inline]
    #[must_use]
    pub fn direct() -> Self {
        Self(vec![WILDCARD.to_string()])
    }

    /// Pattern segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of levels below the list
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl Default for ItemsPattern {
    fn default() -> Self {
        Self::direct()
    }
}

impl fmt::Display for ItemsPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl FromStr for ItemsPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept JSONPath-ish `$.a.*` as well as `/a/*`
        let body = s.trim().trim_start_matches('$');
        let separator = if body.contains('/') { '/' } else { '.' };
        let segments: Vec<String> = body
            .split(separator)
            .filter(|seg| !seg.is_empty())
            .map(str::to_string)
            .collect();
        if segments.is_empty() {
            return Err(PatternError::Empty(s.to_string()));
        }
        Ok(Self(segments))
    }
}

impl Serialize for ItemsPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ItemsPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Items pattern parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    /// Pattern has no segments
    #[error("items pattern '{0}' has no segments")]
    Empty(String),
}
