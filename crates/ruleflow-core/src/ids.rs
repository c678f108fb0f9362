//! Identifiers used across the engine
//!
//! - [`RuleId`]: key of a rule in the rules collection
//! - [`ItemKey`]: location of an item relative to a rule's watched list
//! - [`ResourceId`]: store-wide `_id` of a resource
//! - [`Revision`]: monotonically increasing `_rev` of a resource

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::path::{PathError, ResourcePath};

/// Stable identifier of a rule (its key in the rules collection)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Create rule ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Key of an item relative to the collection it was observed in
///
/// For flat lists this is a single segment (`x1`); nested lists described by
/// an items pattern produce multi-segment keys (`2021-01-01/x1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Create item key
    #[inline]
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key as a relative path
    ///
    /// # Errors
    /// Returns error if the key contains relative segments
    pub fn to_path(&self) -> Result<ResourcePath, PathError> {
        self.0.parse()
    }

    /// Final segment, used as the item's name in destination collections
    #[must_use]
    pub fn name(&self) -> &str {
        self.0
            .rsplit('/')
            .find(|seg| !seg.is_empty())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Store-wide identifier of a resource (`_id`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create resource ID
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path addressing the resource directly
    ///
    /// # Errors
    /// Returns error if the id contains relative segments
    pub fn to_path(&self) -> Result<ResourcePath, PathError> {
        self.0.parse()
    }

    /// Final segment of the id (`resources/abc` → `abc`)
    #[must_use]
    pub fn name(&self) -> &str {
        self.0
            .rsplit('/')
            .find(|seg| !seg.is_empty())
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Revision (`_rev`) of a resource
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// Next revision
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_key_name_is_last_segment() {
        assert_eq!(ItemKey::new("x1").name(), "x1");
        assert_eq!(ItemKey::new("2021-01-01/x1").name(), "x1");
    }

    #[test]
    fn resource_id_name() {
        assert_eq!(ResourceId::new("resources/abc").name(), "abc");
        assert_eq!(ResourceId::new("x2").name(), "x2");
    }

    #[test]
    fn resource_id_path() {
        let path = ResourceId::new("resources/abc").to_path().unwrap();
        assert_eq!(path.to_string(), "/resources/abc");
    }

    #[test]
    fn revision_serde_transparent() {
        let rev: Revision = serde_json::from_str("7").unwrap();
        assert_eq!(rev, Revision(7));
        assert_eq!(rev.next(), Revision(8));
    }
}
