//! Engine instance
//!
//! One instance per credential. It owns its registry and follows the rules
//! collection: every rule present at start-up is registered (full
//! reconcile, no cursor), later additions, edits and removals are applied
//! one at a time.

use std::future::Future;
use std::sync::Arc;

use ruleflow_core::{ChangeEvent, EngineConfig, ItemKey, RuleId};
use ruleflow_store::{ChangeFeed, ResourceStore, WatchSpec};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::executor::RuleExecutor;
use crate::marker::MarkerStore;
use crate::registry::RuleRegistry;
use crate::schema::{JsonSchemaCompiler, SchemaCompiler};
use crate::template::{StrictTemplates, TemplateEngine};
use crate::watcher::WatcherContext;

/// Rule engine bound to one store and change feed
pub struct Instance {
    config: EngineConfig,
    store: Arc<dyn ResourceStore>,
    feed: Arc<dyn ChangeFeed>,
    registry: RuleRegistry,
}

impl Instance {
    /// Create an instance with the stock schema and template engines
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ResourceStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self::with_capabilities(
            config,
            store,
            feed,
            Arc::new(JsonSchemaCompiler),
            Arc::new(StrictTemplates::new()),
        )
    }

    /// Create an instance with custom schema and template engines
    pub fn with_capabilities(
        config: EngineConfig,
        store: Arc<dyn ResourceStore>,
        feed: Arc<dyn ChangeFeed>,
        schemas: Arc<dyn SchemaCompiler>,
        templates: Arc<dyn TemplateEngine>,
    ) -> Self {
        let markers = MarkerStore::new(Arc::clone(&store), config.meta_path.clone());
        let executor = Arc::new(RuleExecutor::new(
            Arc::clone(&store),
            markers,
            config.services_path.clone(),
            config.attach_meta,
        ));
        let ctx = WatcherContext::new(Arc::clone(&store), Arc::clone(&feed), executor)
            .with_check_marker_on_add(config.check_marker_on_add)
            .with_queue_capacity(config.queue_capacity);
        let registry = RuleRegistry::new(Arc::new(ctx), schemas, templates);

        Self {
            config,
            store,
            feed,
            registry,
        }
    }

    /// Active rules
    #[must_use]
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Follow the rules collection until `shutdown` resolves or the feed ends
    ///
    /// Every rule is stopped before returning.
    ///
    /// # Errors
    /// - `EngineError::Store` if the rules collection cannot be prepared or watched
    /// - `EngineError::Registry` if a watcher fails to stop on the way out
    pub async fn run<F>(&self, shutdown: F) -> EngineResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let rules_path = &self.config.rules_path;
        self.store
            .put(rules_path, json!({}), Some(&self.config.rules_tree))
            .await?;

        let spec = WatchSpec::new(rules_path.clone()).with_replay(true);
        let mut subscription = self.feed.subscribe(spec).await?;
        info!(rules = %rules_path, "Watching rules");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    debug!("Shutdown requested");
                    break;
                }
                event = subscription.next() => match event {
                    Some(event) => self.apply(event).await,
                    None => {
                        warn!(rules = %rules_path, "Rules feed ended");
                        break;
                    }
                },
            }
        }

        let stopped = self.registry.stop_all().await;
        let closed = subscription.close().await;
        info!("Instance stopped");
        stopped?;
        closed.map_err(EngineError::from)
    }

    /// Apply one change of the rules collection
    pub async fn apply(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::ItemAdded { key, item } => {
                self.register(&key, &item).await;
            }
            ChangeEvent::ItemChanged { key } => {
                let path = match key.to_path() {
                    Ok(rel) => self.config.rules_path.join(&rel),
                    Err(err) => {
                        error!(rule = %key, error = %err, "Invalid rule key");
                        return;
                    }
                };
                match self.store.get(&path).await {
                    Ok(document) => self.register(&key, &document).await,
                    Err(err) if err.is_not_found() => {
                        debug!(rule = %key, "Changed rule is gone");
                    }
                    Err(err) => error!(rule = %key, error = %err, "Failed to fetch rule"),
                }
            }
            ChangeEvent::ItemRemoved { key } => {
                if let Err(err) = self.registry.unregister(&rule_id(&key)).await {
                    error!(rule = %key, error = %err, "Failed to unregister rule");
                }
            }
        }
    }

    async fn register(&self, key: &ItemKey, document: &serde_json::Value) {
        if let Err(err) = self.registry.register(rule_id(key), document).await {
            if err.is_config_error() {
                warn!(rule = %key, error = %err, "Rule rejected");
            } else {
                error!(rule = %key, error = %err, "Failed to register rule");
            }
        }
    }
}

fn rule_id(key: &ItemKey) -> RuleId {
    RuleId::new(key.name())
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("rules_path", &self.config.rules_path)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
