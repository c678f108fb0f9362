//! Rule watcher
//!
//! One watcher per active rule. It owns the subscription on the rule's list
//! and two tasks:
//! - the pump forwards change events into the rule's queue
//! - the worker takes one event at a time, decides whether the rule must
//!   run and runs it
//!
//! The worker never starts an execution before the previous one finished,
//! so executions of one rule are strictly ordered. Rules are independent.
//!
//! Stopping drops whatever is still queued, lets an in-flight execution
//! finish, and closes the subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ruleflow_core::{ChangeEvent, ResourcePath, RuleId};
use ruleflow_store::{ChangeFeed, ResourceStore, StoreError, StoreResult, Subscription, WatchSpec};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::error::{ExecutionError, RegistryError};
use crate::executor::{CompiledRule, Item, Outcome, RuleExecutor};
use crate::metrics;

/// Shared by every watcher of an instance
pub struct WatcherContext {
    store: Arc<dyn ResourceStore>,
    feed: Arc<dyn ChangeFeed>,
    executor: Arc<RuleExecutor>,
    check_marker_on_add: bool,
    queue_capacity: usize,
}

impl WatcherContext {
    /// Create context; markers are checked for every event kind
    pub fn new(
        store: Arc<dyn ResourceStore>,
        feed: Arc<dyn ChangeFeed>,
        executor: Arc<RuleExecutor>,
    ) -> Self {
        Self {
            store,
            feed,
            executor,
            check_marker_on_add: true,
            queue_capacity: 1024,
        }
    }

    /// With marker check on added items enabled or disabled
    #[must_use]
    pub fn with_check_marker_on_add(mut self, check: bool) -> Self {
        self.check_marker_on_add = check;
        self
    }

    /// With per-rule queue capacity
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

impl std::fmt::Debug for WatcherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherContext")
            .field("check_marker_on_add", &self.check_marker_on_add)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

/// Per-watcher counters
#[derive(Debug, Default)]
pub struct WatcherStats {
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    marker_hits: AtomicU64,
}

impl WatcherStats {
    /// Executions that applied the action
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Executions skipped on schema mismatch
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Executions that failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Events dropped because the marker was present
    pub fn marker_hits(&self) -> u64 {
        self.marker_hits.load(Ordering::Relaxed)
    }

    /// Executions started, whatever their outcome
    pub fn executions(&self) -> u64 {
        self.applied() + self.skipped() + self.failed()
    }
}

/// Live watcher of one rule
pub struct RuleWatcher {
    rule: Arc<CompiledRule>,
    shutdown: watch::Sender<bool>,
    pump: JoinHandle<StoreResult<()>>,
    worker: JoinHandle<()>,
    stats: Arc<WatcherStats>,
}

impl RuleWatcher {
    /// Subscribe to the rule's list and start processing
    ///
    /// Items already in the list are delivered as added.
    ///
    /// # Errors
    /// `RegistryError::Subscribe` if the watch cannot be started
    pub async fn start(
        rule: Arc<CompiledRule>,
        ctx: Arc<WatcherContext>,
    ) -> Result<Self, RegistryError> {
        let spec = WatchSpec::new(rule.list().clone())
            .with_items(rule.rule().items_path.clone())
            .with_replay(true);
        let subscription =
            ctx.feed
                .subscribe(spec)
                .await
                .map_err(|source| RegistryError::Subscribe {
                    rule: rule.id().clone(),
                    source,
                })?;

        let (shutdown, _) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(ctx.queue_capacity);
        let stats = Arc::new(WatcherStats::default());

        let pump = tokio::spawn(pump(
            Arc::clone(&rule),
            subscription,
            queue_tx,
            shutdown.subscribe(),
        ));
        let worker = tokio::spawn(work(
            Arc::clone(&rule),
            ctx,
            queue_rx,
            shutdown.subscribe(),
            Arc::clone(&stats),
        ));

        debug!(rule = %rule.id(), list = %rule.list(), "Watcher started");
        Ok(Self {
            rule,
            shutdown,
            pump,
            worker,
            stats,
        })
    }

    /// Rule identifier
    #[must_use]
    pub fn rule_id(&self) -> &RuleId {
        self.rule.id()
    }

    /// Watched list
    #[must_use]
    pub fn list(&self) -> &ResourcePath {
        self.rule.list()
    }

    /// Counters of this watcher
    #[must_use]
    pub fn stats(&self) -> Arc<WatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Stop the watcher
    ///
    /// Waits for an in-flight execution, drops queued events and releases
    /// the subscription.
    ///
    /// # Errors
    /// - `RegistryError::Unsubscribe` if the subscription could not be released
    /// - `RegistryError::Task` if a watcher task panicked
    pub async fn stop(self) -> Result<(), RegistryError> {
        // Fails only when both tasks are already gone
        let _ = self.shutdown.send(true);
        let rule = self.rule.id().clone();

        let worker = self.worker.await;
        let pump = self.pump.await;

        worker.map_err(|e| RegistryError::Task {
            rule: rule.clone(),
            message: e.to_string(),
        })?;
        match pump {
            Ok(Ok(())) => {
                debug!(rule = %rule, "Watcher stopped");
                Ok(())
            }
            Ok(Err(source)) => Err(RegistryError::Unsubscribe { rule, source }),
            Err(e) => Err(RegistryError::Task {
                rule,
                message: e.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for RuleWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleWatcher")
            .field("rule", self.rule.id())
            .field("list", self.rule.list())
            .finish_non_exhaustive()
    }
}

async fn pump(
    rule: Arc<CompiledRule>,
    mut subscription: Subscription,
    queue: mpsc::Sender<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> StoreResult<()> {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = subscription.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        trace!(rule = %rule.id(), item = %event.key(), kind = event.kind(), "Change received");

        if let ChangeEvent::ItemRemoved { key } = &event {
            debug!(rule = %rule.id(), item = %key, "Item removed, nothing to do");
            continue;
        }

        let sent = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            sent = queue.send(event) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
    subscription.close().await
}

async fn work(
    rule: Arc<CompiledRule>,
    ctx: Arc<WatcherContext>,
    mut queue: mpsc::Receiver<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<WatcherStats>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = queue.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        process(&rule, &ctx, &stats, event).await;
    }

    let dropped = queue.len();
    if dropped > 0 {
        debug!(rule = %rule.id(), dropped, "Dropped queued events on stop");
    }
}

async fn process(rule: &CompiledRule, ctx: &WatcherContext, stats: &WatcherStats, event: ChangeEvent) {
    let key = event.key().clone();
    let action = rule.rule().action.kind();

    let item = match prepare(rule, ctx, stats, event).await {
        Ok(Some(item)) => item,
        Ok(None) => return,
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_execution(action, "failed");
            error!(rule = %rule.id(), item = %key, error = %err, "Failed to load item");
            return;
        }
    };

    match ctx.executor.execute(rule, item).await {
        Ok(outcome) => {
            metrics::record_execution(action, outcome.as_str());
            match outcome {
                Outcome::Applied { revision } => {
                    stats.applied.fetch_add(1, Ordering::Relaxed);
                    info!(rule = %rule.id(), item = %key, revision = %revision, "Rule applied");
                }
                Outcome::Skipped => {
                    stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            metrics::record_execution(action, "failed");
            error!(
                rule = %rule.id(),
                item = %key,
                retryable = err.is_retryable(),
                error = %err,
                "Rule execution failed"
            );
        }
    }
}

/// Decide whether the rule must run for `event` and load the item if so
async fn prepare(
    rule: &CompiledRule,
    ctx: &WatcherContext,
    stats: &WatcherStats,
    event: ChangeEvent,
) -> Result<Option<Item>, ExecutionError> {
    let (key, check_marker, payload) = match event {
        ChangeEvent::ItemAdded { key, item } => (key, ctx.check_marker_on_add, Some(item)),
        ChangeEvent::ItemChanged { key } => (key, true, None),
        ChangeEvent::ItemRemoved { .. } => return Ok(None),
    };
    let relative = key.to_path().map_err(StoreError::from)?;
    let path = rule.list().join(&relative);

    if check_marker && ctx.executor.markers().exists(&path, rule.id()).await? {
        stats.marker_hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_marker_hit();
        debug!(rule = %rule.id(), item = %key, "Marker present, skipping");
        return Ok(None);
    }

    let data = match payload {
        Some(item) if !item.is_null() => item,
        _ => match ctx.store.get(&path).await {
            Ok(data) => data,
            Err(err) if err.is_not_found() => {
                debug!(rule = %rule.id(), item = %key, "Item is gone");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        },
    };
    Ok(Some(Item { key, path, data }))
}
