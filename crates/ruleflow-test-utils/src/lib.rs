//! Testing utilities for the ruleflow workspace
//!
//! Fixtures, instrumented store wrappers and a harness for running an
//! instance against the in-memory store.

#![allow(missing_docs)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ruleflow_core::{EngineConfig, ResourceId, ResourcePath, Tree, META_SEGMENT};
use ruleflow_engine::{EngineResult, Instance};
use ruleflow_store::{MemoryStore, ResourceStore, StoreError, StoreResult};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default wait for asynchronous effects
pub const WAIT: Duration = Duration::from_secs(5);

pub fn path(s: &str) -> ResourcePath {
    s.parse().unwrap()
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn reindex_rule(list: &str, schema: Value, destination: &str) -> Value {
    json!({
        "list": list,
        "schema": schema,
        "type": "reindex",
        "destination": destination
    })
}

pub fn job_rule(list: &str, schema: Value, service: &str, pointer: &str) -> Value {
    json!({
        "list": list,
        "schema": schema,
        "type": "job",
        "job": { "service": service },
        "pointer": pointer
    })
}

/// Config with markers and rules in their default places
pub fn test_config() -> EngineConfig {
    EngineConfig::new().with_poll_interval_ms(10)
}

/// Store `data` as resource `id` and link it into `list`
pub async fn seed_item(store: &MemoryStore, list: &str, id: &str, data: Value) {
    store.insert_resource(id, data);
    store
        .put(&path(list).child(id), json!({ "_id": id }), None)
        .await
        .unwrap();
}

/// Publish a rule document into the rules collection
pub async fn publish_rule(store: &MemoryStore, config: &EngineConfig, id: &str, rule: Value) {
    store
        .put(
            &config.rules_path.child(id),
            rule,
            Some(&config.rules_tree),
        )
        .await
        .unwrap();
}

/// Marker path of `rule` on resource `item` under the default meta path
pub fn marker_path(config: &EngineConfig, item: &str, rule: &str) -> ResourcePath {
    path(item).meta().join(&config.meta_path).child(rule)
}

/// Poll `check` until it holds or [`WAIT`] elapses
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let spawned tasks drain without asserting anything
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ============================================================================
// Instance harness
// ============================================================================

/// Instance running in the background
pub struct RunningInstance {
    pub instance: Arc<Instance>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<EngineResult<()>>,
}

impl RunningInstance {
    pub async fn stop(self) -> EngineResult<()> {
        let _ = self.stop.send(());
        self.handle.await.unwrap()
    }
}

/// Run an instance whose store and feed are `feed_store`, with store calls
/// routed through `store`
pub fn start_instance(
    config: EngineConfig,
    store: Arc<dyn ResourceStore>,
    feed_store: &MemoryStore,
) -> RunningInstance {
    let instance = Arc::new(Instance::new(config, store, Arc::new(feed_store.clone())));
    let (stop, stopped) = oneshot::channel::<()>();
    let runner = Arc::clone(&instance);
    let handle = tokio::spawn(async move {
        runner
            .run(async move {
                let _ = stopped.await;
            })
            .await
    });
    RunningInstance {
        instance,
        stop,
        handle,
    }
}

/// Run an instance directly on `store`
pub fn start_memory_instance(config: EngineConfig, store: &MemoryStore) -> RunningInstance {
    start_instance(config, Arc::new(store.clone()), store)
}

// ============================================================================
// Instrumented stores
// ============================================================================

/// Counts concurrent store calls
///
/// Every call holds a slot for its whole duration plus `delay`, which
/// widens the window in which overlapping calls would be seen.
pub struct CountingStore {
    inner: Arc<dyn ResourceStore>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    creates: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn ResourceStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    async fn counting<T>(&self, call: impl Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let out = call.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[async_trait]
impl ResourceStore for CountingStore {
    async fn get(&self, path: &ResourcePath) -> StoreResult<Value> {
        self.counting(self.inner.get(path)).await
    }

    async fn head(&self, path: &ResourcePath) -> StoreResult<bool> {
        self.counting(self.inner.head(path)).await
    }

    async fn put(&self, path: &ResourcePath, data: Value, tree: Option<&Tree>) -> StoreResult<()> {
        self.counting(self.inner.put(path, data, tree)).await
    }

    async fn create(&self, data: Value) -> StoreResult<ResourceId> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.counting(self.inner.create(data)).await
    }
}

/// Fails selected writes
pub struct FaultyStore {
    inner: Arc<dyn ResourceStore>,
    failing_prefixes: Mutex<Vec<ResourcePath>>,
    fail_meta: AtomicBool,
    fail_creates: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn ResourceStore>) -> Self {
        Self {
            inner,
            failing_prefixes: Mutex::new(Vec::new()),
            fail_meta: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
        }
    }

    /// Fail every `put` at or below `prefix`
    pub fn fail_puts_under(&self, prefix: &str) {
        self.failing_prefixes.lock().push(path(prefix));
    }

    /// Fail every `put` into metadata, markers included
    pub fn fail_meta_writes(&self, fail: bool) {
        self.fail_meta.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing_prefixes.lock().clear();
        self.fail_meta_writes(false);
        self.fail_creates(false);
    }

    fn injected(path: &ResourcePath) -> StoreError {
        StoreError::Http {
            status: 503,
            path: path.clone(),
            body: "injected failure".into(),
        }
    }

    fn should_fail(&self, target: &ResourcePath) -> bool {
        if self.fail_meta.load(Ordering::SeqCst) && target.iter().any(|s| s == META_SEGMENT) {
            return true;
        }
        self.failing_prefixes
            .lock()
            .iter()
            .any(|prefix| prefix.is_prefix_of(target))
    }
}

#[async_trait]
impl ResourceStore for FaultyStore {
    async fn get(&self, path: &ResourcePath) -> StoreResult<Value> {
        self.inner.get(path).await
    }

    async fn head(&self, path: &ResourcePath) -> StoreResult<bool> {
        self.inner.head(path).await
    }

    async fn put(&self, path: &ResourcePath, data: Value, tree: Option<&Tree>) -> StoreResult<()> {
        if self.should_fail(path) {
            return Err(Self::injected(path));
        }
        self.inner.put(path, data, tree).await
    }

    async fn create(&self, data: Value) -> StoreResult<ResourceId> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Self::injected(&ResourcePath::single("resources")));
        }
        self.inner.create(data).await
    }
}
