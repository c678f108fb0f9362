//! Completion markers
//!
//! A marker records that a rule ran on an item. It lives in the item's
//! metadata at `<item>/_meta/<meta_path>/<rule id>` as `{"_rev": n}`, where
//! `n` is the item revision the rule ran against.

use std::sync::Arc;

use ruleflow_core::json::revision;
use ruleflow_core::{ResourcePath, Revision, RuleId};
use ruleflow_store::{ResourceStore, StoreResult};
use serde_json::json;
use tracing::trace;

/// Reads and writes completion markers
#[derive(Clone)]
pub struct MarkerStore {
    store: Arc<dyn ResourceStore>,
    meta_path: ResourcePath,
}

impl MarkerStore {
    /// Create marker store keeping markers under `meta_path`
    pub fn new(store: Arc<dyn ResourceStore>, meta_path: ResourcePath) -> Self {
        Self { store, meta_path }
    }

    /// Where the marker of `rule` on `item` lives
    #[must_use]
    pub fn marker_path(&self, item: &ResourcePath, rule: &RuleId) -> ResourcePath {
        item.meta().join(&self.meta_path).child(rule.as_str())
    }

    /// Whether `rule` has run on `item`
    ///
    /// # Errors
    /// Store errors other than not-found
    pub async fn exists(&self, item: &ResourcePath, rule: &RuleId) -> StoreResult<bool> {
        self.store.head(&self.marker_path(item, rule)).await
    }

    /// Revision recorded by the marker, if any
    ///
    /// # Errors
    /// Store errors other than not-found
    pub async fn read(&self, item: &ResourcePath, rule: &RuleId) -> StoreResult<Option<Revision>> {
        match self.store.get(&self.marker_path(item, rule)).await {
            Ok(marker) => Ok(revision(&marker)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Record that `rule` ran on `item` at `rev`
    ///
    /// # Errors
    /// Returns error if the write fails
    pub async fn write(&self, item: &ResourcePath, rule: &RuleId, rev: Revision) -> StoreResult<()> {
        let path = self.marker_path(item, rule);
        trace!(marker = %path, revision = %rev, "Writing marker");
        self.store.put(&path, json!({ "_rev": rev.0 }), None).await
    }
}

impl std::fmt::Debug for MarkerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerStore")
            .field("meta_path", &self.meta_path)
            .finish_non_exhaustive()
    }
}
