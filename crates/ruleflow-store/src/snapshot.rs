//! Collection snapshots
//!
//! Both feeds detect changes the same way: take a snapshot of item keys and
//! revisions, compare it with the previous one, emit the difference.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use ruleflow_core::{ItemKey, Revision};
use serde_json::Value;

/// Item key to revision, at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot(BTreeMap<ItemKey, Revision>);

/// Difference between two snapshots, each list in key order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<ItemKey>,
    pub changed: Vec<ItemKey>,
    pub removed: Vec<ItemKey>,
}

impl SnapshotDiff {
    /// Whether nothing changed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

impl Snapshot {
    /// Create empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an item
    pub fn insert(&mut self, key: ItemKey, revision: Revision) {
        self.0.insert(key, revision);
    }

    /// Revision of an item
    #[must_use]
    pub fn get(&self, key: &ItemKey) -> Option<Revision> {
        self.0.get(key).copied()
    }

    /// Number of items
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Item keys in order
    pub fn keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.0.keys()
    }

    /// What happened between `self` and `next`
    #[must_use]
    pub fn diff(&self, next: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        for (key, rev) in &next.0 {
            match self.0.get(key) {
                None => diff.added.push(key.clone()),
                Some(prev) if prev != rev => diff.changed.push(key.clone()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .0
            .keys()
            .filter(|key| !next.0.contains_key(*key))
            .cloned()
            .collect();
        diff
    }
}

impl FromIterator<(ItemKey, Revision)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (ItemKey, Revision)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Revision standing in for items that carry no `_rev`
///
/// Derived from the content, so it changes exactly when the item does.
#[must_use]
pub fn content_revision(value: &Value) -> Revision {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    Revision(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snap(items: &[(&str, u64)]) -> Snapshot {
        items
            .iter()
            .map(|(k, r)| (ItemKey::from(*k), Revision(*r)))
            .collect()
    }

    #[test]
    fn diff_classifies_every_kind() {
        let before = snap(&[("a", 1), ("b", 1), ("c", 3)]);
        let after = snap(&[("a", 1), ("b", 2), ("d", 1)]);

        let diff = before.diff(&after);
        assert_eq!(diff.added, vec![ItemKey::from("d")]);
        assert_eq!(diff.changed, vec![ItemKey::from("b")]);
        assert_eq!(diff.removed, vec![ItemKey::from("c")]);
    }

    #[test]
    fn identical_snapshots_have_empty_diff() {
        let s = snap(&[("a", 1)]);
        assert!(s.diff(&s.clone()).is_empty());
        assert!(Snapshot::new().diff(&Snapshot::new()).is_empty());
    }

    #[test]
    fn content_revision_tracks_content() {
        let a = serde_json::json!({"x": 1});
        let b = serde_json::json!({"x": 2});
        assert_eq!(content_revision(&a), content_revision(&a.clone()));
        assert_ne!(content_revision(&a), content_revision(&b));
    }
}
