//! In-memory hypermedia store
//!
//! Documents are addressed by id (`resources/<uuid>` or any caller-chosen
//! id); everything reachable from the root document through plain keys and
//! links forms the path namespace. A path whose first one or two segments
//! name a document starts there instead of at the root, so
//! `/resources/abc/_meta` reads the metadata of `resources/abc`.
//!
//! The store is also a [`ChangeFeed`]: after every write each watch
//! re-snapshots its collection and receives the difference.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use ruleflow_core::json::{deep_merge, is_link, is_reserved_key, link, resource_id};
use ruleflow_core::{
    ChangeEvent, ItemKey, ResourceId, ResourcePath, Revision, Tree, META_SEGMENT, WILDCARD,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::feed::{ChangeFeed, Subscription, Unsubscribe, WatchSpec};
use crate::snapshot::{content_revision, Snapshot};
use crate::store::ResourceStore;

const ROOT: &str = "";

/// Shared in-memory store; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    documents: HashMap<String, Document>,
    watches: HashMap<u64, Watch>,
    next_watch: u64,
}

#[derive(Debug)]
struct Document {
    data: Value,
    meta: Value,
    rev: Revision,
}

#[derive(Debug)]
struct Watch {
    spec: WatchSpec,
    snapshot: Snapshot,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

/// Position inside a document
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cursor {
    doc: String,
    meta: bool,
    inner: Vec<String>,
}

enum Step {
    Follow(String),
    Descend,
    Create,
}

impl Document {
    fn new(data: Value) -> Self {
        Self {
            data,
            meta: Value::Object(Map::new()),
            rev: Revision::default(),
        }
    }
}

impl Cursor {
    fn at(doc: impl Into<String>) -> Self {
        Self {
            doc: doc.into(),
            meta: false,
            inner: Vec::new(),
        }
    }

    fn is_document_root(&self) -> bool {
        !self.meta && self.inner.is_empty()
    }

    fn child(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.inner.push(key.to_string());
        next
    }
}

impl Default for Inner {
    fn default() -> Self {
        let mut documents = HashMap::new();
        documents.insert(ROOT.to_string(), Document::new(Value::Object(Map::new())));
        Self {
            documents,
            watches: HashMap::new(),
            next_watch: 1,
        }
    }
}

impl Inner {
    /// Document a path starts in, and how many segments that consumed
    fn start(&self, segments: &[String]) -> (String, usize) {
        if segments.len() >= 2 {
            let id = format!("{}/{}", segments[0], segments[1]);
            if self.documents.contains_key(&id) {
                return (id, 2);
            }
        }
        match segments.first() {
            Some(first) if self.documents.contains_key(first.as_str()) => (first.clone(), 1),
            _ => (ROOT.to_string(), 0),
        }
    }

    fn value(&self, cursor: &Cursor) -> Option<&Value> {
        let doc = self.documents.get(&cursor.doc)?;
        let base = if cursor.meta { &doc.meta } else { &doc.data };
        cursor.inner.iter().try_fold(base, |v, seg| v.get(seg))
    }

    fn value_mut(&mut self, cursor: &Cursor) -> Option<&mut Value> {
        let doc = self.documents.get_mut(&cursor.doc)?;
        let base = if cursor.meta { &mut doc.meta } else { &mut doc.data };
        cursor.inner.iter().try_fold(base, |v, seg| v.get_mut(seg))
    }

    fn object_mut(
        &mut self,
        cursor: &Cursor,
        path: &ResourcePath,
    ) -> StoreResult<&mut Map<String, Value>> {
        self.value_mut(cursor)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| StoreError::invalid_write(path, "parent is not an object"))
    }

    fn resolve(&self, path: &ResourcePath) -> Option<Cursor> {
        let segments = path.segments();
        let (doc, skip) = self.start(segments);
        let mut cursor = Cursor::at(doc);
        for seg in &segments[skip..] {
            if cursor.is_document_root() && seg == META_SEGMENT {
                cursor.meta = true;
                continue;
            }
            let child = self.value(&cursor)?.get(seg)?;
            if is_link(child) {
                let id = resource_id(child)?;
                if !self.documents.contains_key(id.as_str()) {
                    return None;
                }
                cursor = Cursor::at(id.as_str());
            } else {
                cursor.inner.push(seg.clone());
            }
        }
        Some(cursor)
    }

    fn read(&self, path: &ResourcePath) -> Option<Value> {
        let cursor = self.resolve(path)?;
        let mut value = self.value(&cursor)?.clone();
        if cursor.is_document_root() && cursor.doc != ROOT {
            if let (Some(map), Some(doc)) =
                (value.as_object_mut(), self.documents.get(&cursor.doc))
            {
                map.insert("_id".into(), Value::String(cursor.doc.clone()));
                map.insert("_rev".into(), Value::from(doc.rev.0));
            }
        }
        Some(value)
    }

    fn allocate(&mut self, content_type: Option<&str>) -> String {
        let id = format!("resources/{}", Uuid::new_v4());
        let mut data = Map::new();
        if let Some(ct) = content_type {
            data.insert("_type".into(), Value::String(ct.to_string()));
        }
        self.documents
            .insert(id.clone(), Document::new(Value::Object(data)));
        id
    }

    /// Move `cursor` one segment down, creating the level when missing
    fn step(
        &mut self,
        cursor: &mut Cursor,
        path: &ResourcePath,
        index: usize,
        tree: Option<&Tree>,
        touched: &mut Vec<String>,
    ) -> StoreResult<()> {
        let segments = path.segments();
        let seg = &segments[index];
        if cursor.is_document_root() && seg == META_SEGMENT {
            cursor.meta = true;
            return Ok(());
        }

        let step = match self.value(cursor) {
            Some(Value::Object(map)) => match map.get(seg) {
                Some(child) if is_link(child) => match resource_id(child) {
                    Some(id) => Step::Follow(id.as_str().to_string()),
                    None => Step::Descend,
                },
                Some(_) => Step::Descend,
                None => Step::Create,
            },
            _ => {
                return Err(StoreError::invalid_write(
                    path,
                    format!("'{seg}' is below a non-object value"),
                ))
            }
        };

        match step {
            Step::Follow(id) => {
                self.documents
                    .entry(id.clone())
                    .or_insert_with(|| Document::new(Value::Object(Map::new())));
                *cursor = Cursor::at(id);
            }
            Step::Descend => cursor.inner.push(seg.clone()),
            Step::Create => {
                let level = tree
                    .and_then(|t| t.descend(segments[..=index].iter().map(String::as_str)))
                    .filter(Tree::is_resource);
                let (value, followed) = match level {
                    Some(level) => {
                        let id = self.allocate(level.content_type());
                        touched.push(id.clone());
                        let pinned = level.is_versioned().then_some(Revision(1));
                        (link(&ResourceId::new(id.clone()), pinned), Some(id))
                    }
                    None => (Value::Object(Map::new()), None),
                };
                self.object_mut(cursor, path)?.insert(seg.clone(), value);
                touched.push(cursor.doc.clone());
                match followed {
                    Some(id) => *cursor = Cursor::at(id),
                    None => cursor.inner.push(seg.clone()),
                }
            }
        }
        Ok(())
    }

    fn write(&mut self, path: &ResourcePath, data: Value, tree: Option<&Tree>) -> StoreResult<()> {
        let segments = path.segments();
        let (doc, skip) = self.start(segments);
        let mut cursor = Cursor::at(doc);
        let mut touched = Vec::new();

        let places_link =
            is_link(&data) && segments.len() > skip && segments.last().is_some_and(|s| s != META_SEGMENT);

        if places_link {
            for index in skip..segments.len() - 1 {
                self.step(&mut cursor, path, index, tree, &mut touched)?;
            }
            let last = segments[segments.len() - 1].clone();
            self.object_mut(&cursor, path)?.insert(last, data);
        } else {
            for index in skip..segments.len() {
                self.step(&mut cursor, path, index, tree, &mut touched)?;
            }
            let at_root = cursor.is_document_root() || (cursor.meta && cursor.inner.is_empty());
            if at_root && !data.is_object() {
                return Err(StoreError::invalid_write(path, "document body must be an object"));
            }
            let data = if at_root { strip_bookkeeping(data) } else { data };
            let target = self
                .value_mut(&cursor)
                .ok_or_else(|| StoreError::NotFound(path.clone()))?;
            deep_merge(target, data);
        }
        touched.push(cursor.doc);

        touched.sort();
        touched.dedup();
        for id in touched {
            if let Some(doc) = self.documents.get_mut(&id) {
                doc.rev = doc.rev.next();
            }
        }
        trace!(path = %path, "Write applied");
        Ok(())
    }

    fn remove(&mut self, path: &ResourcePath) -> StoreResult<()> {
        let (parent, last) = match (path.parent(), path.last()) {
            (Some(parent), Some(last)) => (parent, last.to_string()),
            _ => return Err(StoreError::invalid_write(path, "cannot delete the root")),
        };
        let cursor = self
            .resolve(&parent)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        let removed = self.object_mut(&cursor, path)?.remove(&last);
        if removed.is_none() {
            return Err(StoreError::NotFound(path.clone()));
        }
        if let Some(doc) = self.documents.get_mut(&cursor.doc) {
            doc.rev = doc.rev.next();
        }
        Ok(())
    }

    fn snapshot(&self, spec: &WatchSpec) -> Snapshot {
        let mut out = Snapshot::new();
        if let Some(cursor) = self.resolve(&spec.path) {
            let mut prefix = Vec::new();
            self.collect(&cursor, spec.items.segments(), &mut prefix, &mut out);
        }
        out
    }

    fn collect(
        &self,
        cursor: &Cursor,
        pattern: &[String],
        prefix: &mut Vec<String>,
        out: &mut Snapshot,
    ) {
        let Some((head, rest)) = pattern.split_first() else {
            let revision = if cursor.is_document_root() {
                self.documents.get(&cursor.doc).map(|d| d.rev)
            } else {
                self.value(cursor).map(content_revision)
            };
            if let Some(revision) = revision {
                out.insert(ItemKey::new(prefix.join("/")), revision);
            }
            return;
        };
        let Some(Value::Object(map)) = self.value(cursor) else {
            return;
        };
        for (key, child) in map {
            if is_reserved_key(key) || (head != WILDCARD && key != head) {
                continue;
            }
            let next = if is_link(child) {
                match resource_id(child) {
                    Some(id) if self.documents.contains_key(id.as_str()) => Cursor::at(id.as_str()),
                    _ => continue,
                }
            } else if child.is_object() {
                cursor.child(key)
            } else {
                continue;
            };
            prefix.push(key.clone());
            self.collect(&next, rest, prefix, out);
            prefix.pop();
        }
    }

    fn item(&self, spec: &WatchSpec, key: &ItemKey) -> Value {
        key.to_path()
            .ok()
            .and_then(|rel| self.read(&spec.path.join(&rel)))
            .unwrap_or(Value::Null)
    }

    /// Deliver the changes every watch has not seen yet
    fn notify(&mut self) {
        let mut pending = Vec::new();
        for (id, watch) in &self.watches {
            let next = self.snapshot(&watch.spec);
            let diff = watch.snapshot.diff(&next);
            if !diff.is_empty() {
                pending.push((*id, next, diff));
            }
        }

        let mut dead = Vec::new();
        for (id, next, diff) in pending {
            let Some(watch) = self.watches.get(&id) else {
                continue;
            };
            let mut events: Vec<ChangeEvent> = diff
                .added
                .into_iter()
                .map(|key| ChangeEvent::ItemAdded {
                    item: self.item(&watch.spec, &key),
                    key,
                })
                .collect();
            events.extend(diff.changed.into_iter().map(|key| ChangeEvent::ItemChanged { key }));
            events.extend(diff.removed.into_iter().map(|key| ChangeEvent::ItemRemoved { key }));

            if events.into_iter().any(|event| watch.events.send(event).is_err()) {
                dead.push(id);
            }
            if let Some(watch) = self.watches.get_mut(&id) {
                watch.snapshot = next;
            }
        }
        for id in dead {
            debug!(watch = id, "Dropping watch with no receiver");
            self.watches.remove(&id);
        }
    }
}

fn strip_bookkeeping(mut data: Value) -> Value {
    if let Some(map) = data.as_object_mut() {
        map.remove("_id");
        map.remove("_rev");
    }
    data
}

impl MemoryStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a resource under a chosen id, replacing any previous one
    ///
    /// Returns the new revision. The resource is not linked anywhere.
    pub fn insert_resource(&self, id: impl Into<String>, data: Value) -> Revision {
        let mut inner = self.inner.lock();
        let id = id.into();
        let rev = inner.documents.get(&id).map_or(Revision(1), |d| d.rev.next());
        let mut doc = Document::new(strip_bookkeeping(data));
        doc.rev = rev;
        inner.documents.insert(id, doc);
        inner.notify();
        rev
    }

    /// Remove whatever sits at `path` from its parent
    ///
    /// # Errors
    /// `StoreError::NotFound` if nothing exists at `path`
    pub fn delete(&self, path: &ResourcePath) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.remove(path)?;
        inner.notify();
        Ok(())
    }

    /// Current revision of a resource
    #[must_use]
    pub fn revision(&self, id: &ResourceId) -> Option<Revision> {
        self.inner.lock().documents.get(id.as_str()).map(|d| d.rev)
    }

    /// Number of live watches
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.inner.lock().watches.len()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, path: &ResourcePath) -> StoreResult<Value> {
        self.inner
            .lock()
            .read(path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))
    }

    async fn head(&self, path: &ResourcePath) -> StoreResult<bool> {
        Ok(self.inner.lock().resolve(path).is_some())
    }

    async fn put(
        &self,
        path: &ResourcePath,
        data: Value,
        tree: Option<&Tree>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.write(path, data, tree)?;
        inner.notify();
        Ok(())
    }

    async fn create(&self, data: Value) -> StoreResult<ResourceId> {
        if !data.is_object() {
            return Err(StoreError::invalid_write(
                &ResourcePath::single("resources"),
                "document body must be an object",
            ));
        }
        let mut inner = self.inner.lock();
        let id = inner.allocate(None);
        if let Some(doc) = inner.documents.get_mut(&id) {
            deep_merge(&mut doc.data, strip_bookkeeping(data));
            doc.rev = doc.rev.next();
        }
        trace!(id = %id, "Resource created");
        Ok(ResourceId::new(id))
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, spec: WatchSpec) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_watch;
        inner.next_watch += 1;

        let snapshot = inner.snapshot(&spec);
        if spec.replay_existing {
            for key in snapshot.keys() {
                let item = inner.item(&spec, key);
                // Receiver is still in scope, sending cannot fail
                let _ = tx.send(ChangeEvent::ItemAdded {
                    key: key.clone(),
                    item,
                });
            }
        }
        debug!(watch = id, path = %spec.path, items = snapshot.len(), "Watch started");

        let path = spec.path.clone();
        inner.watches.insert(
            id,
            Watch {
                spec,
                snapshot,
                events: tx,
            },
        );
        let closer = MemoryUnsubscribe {
            inner: Arc::downgrade(&self.inner),
        };
        Ok(Subscription::new(id, path, rx, Box::new(closer)))
    }
}

struct MemoryUnsubscribe {
    inner: Weak<Mutex<Inner>>,
}

#[async_trait]
impl Unsubscribe for MemoryUnsubscribe {
    async fn unsubscribe(self: Box<Self>, id: u64) -> StoreResult<()> {
        let inner = self.inner.upgrade().ok_or(StoreError::Closed(id))?;
        let removed = inner.lock().watches.remove(&id);
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::Closed(id)),
        }
    }
}
