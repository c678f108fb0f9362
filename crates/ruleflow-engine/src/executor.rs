//! Rule execution
//!
//! [`RuleExecutor::execute`] runs one compiled rule on one item:
//! 1. attach the item's `_meta` (when enabled)
//! 2. validate against the rule schema; a mismatch is `Skipped`
//! 3. merge the rule's `meta` into the item's metadata
//! 4. perform the action (reindex or job)
//! 5. write the completion marker
//!
//! The marker is written last. Any failure before it leaves no marker, so
//! a later event for the same item retries.

use std::sync::Arc;

use ruleflow_core::json::{link, resource_id, revision};
use ruleflow_core::{ItemKey, ResourcePath, Revision, Rule, RuleAction, RuleId};
use ruleflow_store::ResourceStore;
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::error::{ExecutionError, RegistryError};
use crate::marker::MarkerStore;
use crate::resolver::{DestinationResolver, JobTemplate};
use crate::schema::{ItemPredicate, SchemaCompiler};
use crate::template::TemplateEngine;

/// A rule with its schema and templates compiled
#[derive(Debug)]
pub struct CompiledRule {
    id: RuleId,
    rule: Rule,
    predicate: Arc<dyn ItemPredicate>,
    action: CompiledAction,
}

#[derive(Debug)]
enum CompiledAction {
    Reindex {
        destination: DestinationResolver,
        versioned: bool,
    },
    Job {
        template: JobTemplate,
    },
}

impl CompiledRule {
    /// Compile `rule` for execution
    ///
    /// # Errors
    /// - `RegistryError::Schema` if the schema does not compile
    /// - `RegistryError::Template` if the destination or a job field does not compile
    pub fn compile(
        id: RuleId,
        rule: Rule,
        schemas: &dyn SchemaCompiler,
        templates: &dyn TemplateEngine,
    ) -> Result<Self, RegistryError> {
        let predicate = schemas.compile(&rule.schema)?;
        let action = match &rule.action {
            RuleAction::Reindex {
                destination,
                versioned,
            } => CompiledAction::Reindex {
                destination: DestinationResolver::compile(templates, destination)?,
                versioned: *versioned,
            },
            RuleAction::Job { job, pointer } => CompiledAction::Job {
                template: JobTemplate::compile(templates, job, pointer)?,
            },
        };
        Ok(Self {
            id,
            rule,
            predicate,
            action,
        })
    }

    /// Rule identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> &RuleId {
        &self.id
    }

    /// Decoded definition
    #[inline]
    #[must_use]
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Watched collection
    #[inline]
    #[must_use]
    pub fn list(&self) -> &ResourcePath {
        &self.rule.list
    }
}

/// Item handed to the executor
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Key below the rule's list
    pub key: ItemKey,
    /// Path of the item through the list
    pub path: ResourcePath,
    /// Full representation
    pub data: Value,
}

impl Item {
    /// Where the item's metadata and marker are addressed
    ///
    /// The resource itself when the item has an `_id`, its list path otherwise.
    #[must_use]
    pub fn address(&self) -> ResourcePath {
        resource_id(&self.data)
            .and_then(|id| id.to_path().ok())
            .unwrap_or_else(|| self.path.clone())
    }

    /// Revision the rule runs against
    #[must_use]
    pub fn revision(&self) -> Revision {
        revision(&self.data).unwrap_or_default()
    }
}

/// Result of running a rule on an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Item does not match the schema; nothing was written
    Skipped,
    /// Action applied and marker written at `revision`
    Applied { revision: Revision },
}

impl Outcome {
    /// Label for logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Applied { .. } => "applied",
        }
    }
}

/// Runs compiled rules against items
pub struct RuleExecutor {
    store: Arc<dyn ResourceStore>,
    markers: MarkerStore,
    services_path: ResourcePath,
    attach_meta: bool,
}

impl RuleExecutor {
    /// Create executor
    pub fn new(
        store: Arc<dyn ResourceStore>,
        markers: MarkerStore,
        services_path: ResourcePath,
        attach_meta: bool,
    ) -> Self {
        Self {
            store,
            markers,
            services_path,
            attach_meta,
        }
    }

    /// Marker store used for completion markers
    #[must_use]
    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Run `rule` on `item`
    ///
    /// # Errors
    /// Any failure of the metadata fetch, the action or the marker write.
    /// No marker is written when an error is returned.
    pub async fn execute(
        &self,
        rule: &CompiledRule,
        mut item: Item,
    ) -> Result<Outcome, ExecutionError> {
        if self.attach_meta {
            self.attach_meta(&mut item).await?;
        }

        if !rule.predicate.matches(&item.data) {
            debug!(
                rule = %rule.id,
                item = %item.key,
                violations = ?rule.predicate.violations(&item.data),
                "Item does not match rule schema"
            );
            return Ok(Outcome::Skipped);
        }

        let address = item.address();
        let rev = item.revision();

        if let Some(meta) = &rule.rule.meta {
            // Metadata is advisory; the action proceeds without it
            if let Err(err) = self
                .store
                .put(&address.meta(), Value::Object(meta.clone()), None)
                .await
            {
                warn!(rule = %rule.id, item = %item.key, error = %err, "Failed to merge rule meta");
            }
        }

        match &rule.action {
            CompiledAction::Reindex {
                destination,
                versioned,
            } => {
                self.reindex(rule, &item, destination, *versioned, rev)
                    .await?;
            }
            CompiledAction::Job { template } => {
                self.spawn_job(rule, &item, template).await?;
            }
        }

        self.markers.write(&address, &rule.id, rev).await?;
        Ok(Outcome::Applied { revision: rev })
    }

    async fn attach_meta(&self, item: &mut Item) -> Result<(), ExecutionError> {
        let meta = match self.store.get(&item.path.meta()).await {
            Ok(meta) => meta,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if let Some(map) = item.data.as_object_mut() {
            map.insert("_meta".into(), meta);
        }
        Ok(())
    }

    async fn reindex(
        &self,
        rule: &CompiledRule,
        item: &Item,
        destination: &DestinationResolver,
        versioned: bool,
        rev: Revision,
    ) -> Result<(), ExecutionError> {
        let id = resource_id(&item.data)
            .ok_or_else(|| ExecutionError::NotAResource(item.key.to_string()))?;
        let target = destination.resolve(&item.data)?;
        let tree = rule.rule.tree.as_ref();

        self.store.put(&target, json!({}), tree).await?;
        let link_path = target.child(item.key.name());
        trace!(rule = %rule.id, link = %link_path, "Linking item");
        self.store
            .put(&link_path, link(&id, versioned.then_some(rev)), tree)
            .await?;
        Ok(())
    }

    async fn spawn_job(
        &self,
        rule: &CompiledRule,
        item: &Item,
        template: &JobTemplate,
    ) -> Result<(), ExecutionError> {
        let id = resource_id(&item.data)
            .ok_or_else(|| ExecutionError::NotAResource(item.key.to_string()))?;
        let job = template.materialize(&item.data, &id)?;
        let service = JobTemplate::queue_service(&job)?.to_string();
        let job_id = self.store.create(job).await?;

        let entry = self
            .services_path
            .child(service.as_str())
            .child("jobs")
            .child(job_id.name());
        trace!(rule = %rule.id, job = %job_id, queue = %entry, "Queueing job");
        self.store
            .put(&entry, json!({ "_id": job_id.as_str() }), None)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for RuleExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleExecutor")
            .field("services_path", &self.services_path)
            .field("attach_meta", &self.attach_meta)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::JsonSchemaCompiler;
    use crate::template::StrictTemplates;
    use pretty_assertions::assert_eq;
    use ruleflow_store::MemoryStore;

    fn p(s: &str) -> ResourcePath {
        s.parse().unwrap()
    }

    fn compile(id: &str, doc: Value) -> CompiledRule {
        let rule = Rule::from_document(&doc).unwrap();
        CompiledRule::compile(RuleId::new(id), rule, &JsonSchemaCompiler, &StrictTemplates::new())
            .unwrap()
    }

    fn executor(store: &MemoryStore) -> RuleExecutor {
        let shared: Arc<dyn ResourceStore> = Arc::new(store.clone());
        let markers = MarkerStore::new(Arc::clone(&shared), p("/services/ruleflow/rules"));
        RuleExecutor::new(shared, markers, p("/bookmarks/services"), true)
    }

    async fn linked_item(store: &MemoryStore, list: &str, id: &str, data: Value) -> Item {
        store.insert_resource(id, data);
        let path = p(list).child(id);
        store.put(&path, json!({ "_id": id }), None).await.unwrap();
        Item {
            key: ItemKey::new(id),
            data: store.get(&path).await.unwrap(),
            path,
        }
    }

    #[tokio::test]
    async fn reindex_links_item_and_writes_marker() {
        let store = MemoryStore::new();
        let rule = compile(
            "r1",
            json!({
                "list": "/docs",
                "schema": {"type": "object", "required": ["foo"]},
                "type": "reindex",
                "destination": "/out/{{foo}}"
            }),
        );
        let item = linked_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;

        let outcome = executor(&store).execute(&rule, item).await.unwrap();
        assert_eq!(outcome, Outcome::Applied { revision: Revision(1) });

        let link = store.get(&p("/out/bar")).await.unwrap();
        assert_eq!(link["x1"], json!({"_id": "x1"}));
        let marker = store
            .get(&p("/x1/_meta/services/ruleflow/rules/r1"))
            .await
            .unwrap();
        assert_eq!(marker, json!({"_rev": 1}));
    }

    #[tokio::test]
    async fn versioned_link_pins_revision() {
        let store = MemoryStore::new();
        let rule = compile(
            "r1",
            json!({
                "list": "/docs",
                "schema": {},
                "type": "reindex",
                "destination": "/out",
                "versioned": true
            }),
        );
        store.insert_resource("x1", json!({"v": 1}));
        store.put(&p("/x1"), json!({"v": 2}), None).await.unwrap();
        let item = linked_item(&store, "/docs", "x1", json!({"v": 3})).await;

        executor(&store).execute(&rule, item).await.unwrap();
        let link = store.get(&p("/out")).await.unwrap();
        assert_eq!(link["x1"]["_rev"], 3);
    }

    #[tokio::test]
    async fn schema_mismatch_skips_without_writes() {
        let store = MemoryStore::new();
        let rule = compile(
            "r1",
            json!({
                "list": "/docs",
                "schema": {"type": "object", "required": ["foo"]},
                "type": "reindex",
                "destination": "/out/{{foo}}"
            }),
        );
        let item = linked_item(&store, "/docs", "x1", json!({"other": 1})).await;

        let outcome = executor(&store).execute(&rule, item).await.unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert!(!store.head(&p("/out")).await.unwrap());
        assert!(!store
            .head(&p("/x1/_meta/services/ruleflow/rules/r1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn job_creates_resource_and_queue_entry() {
        let store = MemoryStore::new();
        let rule = compile(
            "r2",
            json!({
                "list": "/docs",
                "schema": {},
                "type": "job",
                "job": {"service": "svc1"},
                "pointer": "/target"
            }),
        );
        let item = linked_item(&store, "/docs", "x2", json!({})).await;

        executor(&store).execute(&rule, item).await.unwrap();

        let queue = store.get(&p("/bookmarks/services/svc1/jobs")).await.unwrap();
        let entries: Vec<&Value> = queue.as_object().unwrap().values().collect();
        assert_eq!(entries.len(), 1);
        let job_id = entries[0]["_id"].as_str().unwrap();
        let job = store.get(&p(&format!("/{job_id}"))).await.unwrap();
        assert_eq!(job["config"]["target"]["_id"], "x2");
        assert_eq!(job["service"], "svc1");
    }

    #[tokio::test]
    async fn templated_service_queues_under_rendered_name() {
        let store = MemoryStore::new();
        let rule = compile(
            "r2",
            json!({
                "list": "/docs",
                "schema": {},
                "type": "job",
                "job": {"service": "{{svc}}"},
                "pointer": "/target"
            }),
        );
        let item = linked_item(&store, "/docs", "x2", json!({"svc": "ocr"})).await;

        executor(&store).execute(&rule, item).await.unwrap();

        let queue = store.get(&p("/bookmarks/services/ocr/jobs")).await.unwrap();
        let job_id = queue.as_object().unwrap().values().next().unwrap()["_id"]
            .as_str()
            .unwrap()
            .to_string();
        let job = store.get(&p(&format!("/{job_id}"))).await.unwrap();
        assert_eq!(job["service"], "ocr");
        assert!(!store.head(&p("/bookmarks/services/{{svc}}")).await.unwrap());
    }

    #[tokio::test]
    async fn unusable_service_creates_no_job() {
        let store = MemoryStore::new();
        let rule = compile(
            "r2",
            json!({
                "list": "/docs",
                "schema": {},
                "type": "job",
                "job": {"service": "{{svc}}"},
                "pointer": "/target"
            }),
        );
        let item = linked_item(&store, "/docs", "x2", json!({"svc": ""})).await;

        let err = executor(&store).execute(&rule, item).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidService(_)));
        assert!(!store
            .head(&p("/x2/_meta/services/ruleflow/rules/r2"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rule_meta_is_merged_and_visible_to_schema() {
        let store = MemoryStore::new();
        let rule = compile(
            "r1",
            json!({
                "list": "/docs",
                "schema": {},
                "type": "reindex",
                "destination": "/out",
                "meta": {"routed": true}
            }),
        );
        let item = linked_item(&store, "/docs", "x1", json!({})).await;
        executor(&store).execute(&rule, item).await.unwrap();
        assert_eq!(store.get(&p("/x1/_meta/routed")).await.unwrap(), json!(true));

        let gated = compile(
            "r3",
            json!({
                "list": "/docs",
                "schema": {"required": ["_meta"], "properties": {"_meta": {"required": ["routed"]}}},
                "type": "reindex",
                "destination": "/routed"
            }),
        );
        let item = Item {
            key: ItemKey::new("x1"),
            path: p("/docs/x1"),
            data: store.get(&p("/docs/x1")).await.unwrap(),
        };
        let outcome = executor(&store).execute(&gated, item).await.unwrap();
        assert!(matches!(outcome, Outcome::Applied { .. }));
    }

    #[tokio::test]
    async fn template_failure_leaves_no_marker() {
        let store = MemoryStore::new();
        let rule = compile(
            "r1",
            json!({
                "list": "/docs",
                "schema": {},
                "type": "reindex",
                "destination": "/out/{{missing}}"
            }),
        );
        let item = linked_item(&store, "/docs", "x1", json!({})).await;

        let err = executor(&store).execute(&rule, item).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Template(_)));
        assert!(!store
            .head(&p("/x1/_meta/services/ruleflow/rules/r1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn inline_items_cannot_be_linked() {
        let store = MemoryStore::new();
        let rule = compile(
            "r1",
            json!({"list": "/docs", "schema": {}, "type": "reindex", "destination": "/out"}),
        );
        store.put(&p("/docs/a"), json!({"n": 1}), None).await.unwrap();
        let item = Item {
            key: ItemKey::new("a"),
            path: p("/docs/a"),
            data: json!({"n": 1}),
        };
        let err = executor(&store).execute(&rule, item).await.unwrap_err();
        assert!(matches!(err, ExecutionError::NotAResource(_)));
    }
}
