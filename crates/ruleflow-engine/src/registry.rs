//! Rule registry
//!
//! Keeps `rule id -> watcher` consistent with the rules collection. Only the
//! instance's rules loop calls into it, one event at a time, so at most one
//! watcher exists per rule id.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use ruleflow_core::{Rule, RuleId};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::RegistryError;
use crate::executor::CompiledRule;
use crate::metrics;
use crate::schema::SchemaCompiler;
use crate::template::TemplateEngine;
use crate::watcher::{RuleWatcher, WatcherContext, WatcherStats};

/// Active rules of one instance
pub struct RuleRegistry {
    watchers: DashMap<RuleId, RuleWatcher>,
    ctx: Arc<WatcherContext>,
    schemas: Arc<dyn SchemaCompiler>,
    templates: Arc<dyn TemplateEngine>,
}

impl RuleRegistry {
    /// Create empty registry
    pub fn new(
        ctx: Arc<WatcherContext>,
        schemas: Arc<dyn SchemaCompiler>,
        templates: Arc<dyn TemplateEngine>,
    ) -> Self {
        Self {
            watchers: DashMap::new(),
            ctx,
            schemas,
            templates,
        }
    }

    /// Activate the rule stored as `document` under `id`
    ///
    /// The document is decoded and compiled first. An invalid document is
    /// rejected and whatever watcher already runs for `id` keeps running.
    /// A valid one replaces the previous watcher, which is stopped before
    /// the new one subscribes.
    ///
    /// # Errors
    /// - `RegistryError::InvalidRule`, `Schema` or `Template` for a bad definition
    /// - `RegistryError::Subscribe` if the rule's list cannot be watched
    pub async fn register(&self, id: RuleId, document: &Value) -> Result<(), RegistryError> {
        let result = match self.compile(id.clone(), document) {
            Ok(compiled) => self.activate(compiled).await,
            Err(err) => {
                if self.watchers.contains_key(&id) {
                    warn!(rule = %id, error = %err, "Invalid edit, keeping previous definition");
                }
                Err(err)
            }
        };
        if let Err(err) = &result {
            metrics::record_rule_rejected(if err.is_config_error() {
                "definition"
            } else {
                "watch"
            });
        }
        metrics::set_active_rules(self.watchers.len());
        result
    }

    fn compile(&self, id: RuleId, document: &Value) -> Result<CompiledRule, RegistryError> {
        let rule = Rule::from_document(document)?;
        CompiledRule::compile(id, rule, self.schemas.as_ref(), self.templates.as_ref())
    }

    async fn activate(&self, compiled: CompiledRule) -> Result<(), RegistryError> {
        let id = compiled.id().clone();
        if let Some((_, previous)) = self.watchers.remove(&id) {
            info!(rule = %id, "Replacing rule");
            if let Err(err) = previous.stop().await {
                error!(rule = %id, error = %err, "Failed to stop previous watcher");
            }
        }

        let action = compiled.rule().action.kind();
        let list = compiled.list().clone();
        let watcher = RuleWatcher::start(Arc::new(compiled), Arc::clone(&self.ctx)).await?;
        self.watchers.insert(id.clone(), watcher);

        metrics::record_rule_registered(action);
        info!(rule = %id, list = %list, action, "Rule registered");
        Ok(())
    }

    /// Stop and forget the rule `id`
    ///
    /// Returns whether a watcher was running.
    ///
    /// # Errors
    /// Returns error if the watcher could not be stopped cleanly; it is
    /// removed regardless
    pub async fn unregister(&self, id: &RuleId) -> Result<bool, RegistryError> {
        let Some((_, watcher)) = self.watchers.remove(id) else {
            warn!(rule = %id, "Unregister of unknown rule");
            return Ok(false);
        };
        metrics::record_rule_unregistered();
        metrics::set_active_rules(self.watchers.len());
        info!(rule = %id, "Rule unregistered");
        watcher.stop().await?;
        Ok(true)
    }

    /// Stop every watcher
    ///
    /// # Errors
    /// Returns the first failure; every watcher is stopped regardless
    pub async fn stop_all(&self) -> Result<(), RegistryError> {
        let ids: Vec<RuleId> = self.watchers.iter().map(|e| e.key().clone()).collect();
        let watchers: Vec<RuleWatcher> = ids
            .iter()
            .filter_map(|id| self.watchers.remove(id).map(|(_, w)| w))
            .collect();
        metrics::set_active_rules(self.watchers.len());

        let mut first = None;
        for result in join_all(watchers.into_iter().map(RuleWatcher::stop)).await {
            if let Err(err) = result {
                error!(error = %err, "Failed to stop watcher");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Whether rule `id` is active
    #[must_use]
    pub fn contains(&self, id: &RuleId) -> bool {
        self.watchers.contains_key(id)
    }

    /// Number of active rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    /// Whether no rule is active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Ids of active rules, sorted
    #[must_use]
    pub fn rule_ids(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.watchers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Counters of rule `id`'s current watcher
    #[must_use]
    pub fn stats(&self, id: &RuleId) -> Option<Arc<WatcherStats>> {
        self.watchers.get(id).map(|w| w.stats())
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.rule_ids())
            .finish_non_exhaustive()
    }
}
