//! Polling change feed
//!
//! Works over any [`ResourceStore`]: re-reads the watched collection on an
//! interval and emits the snapshot difference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ruleflow_core::json::{is_link, is_reserved_key, revision};
use ruleflow_core::{ChangeEvent, ItemKey, ResourcePath, Revision, WILDCARD};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::feed::{ChangeFeed, Subscription, Unsubscribe, WatchSpec};
use crate::snapshot::{content_revision, Snapshot};
use crate::store::ResourceStore;

/// Change feed that polls a store
pub struct PollingFeed {
    store: Arc<dyn ResourceStore>,
    interval: Duration,
    next_id: AtomicU64,
}

impl PollingFeed {
    /// Create a feed polling `store` every `interval`
    pub fn new(store: Arc<dyn ResourceStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            next_id: AtomicU64::new(1),
        }
    }
}

impl std::fmt::Debug for PollingFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingFeed")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Read the current snapshot of a watched collection
///
/// A missing collection (or level) reads as empty.
///
/// # Errors
/// Any store error other than not-found
pub async fn read_snapshot(store: &dyn ResourceStore, spec: &WatchSpec) -> StoreResult<Snapshot> {
    // (relative key, revision known from a versioned link)
    let mut frontier: Vec<(Vec<String>, Option<Revision>)> = vec![(Vec::new(), None)];

    for pattern in spec.items.segments() {
        let mut next = Vec::new();
        for (rel, _) in frontier {
            let value = match store.get(&spec.path.join(&ResourcePath::new(rel.clone()))).await {
                Ok(value) => value,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            let Some(map) = value.as_object() else {
                continue;
            };
            for (key, child) in map {
                let wanted = pattern == WILDCARD || key == pattern;
                if is_reserved_key(key) || !wanted || !child.is_object() {
                    continue;
                }
                let pinned = if is_link(child) { revision(child) } else { None };
                let mut key_path = rel.clone();
                key_path.push(key.clone());
                next.push((key_path, pinned));
            }
        }
        frontier = next;
    }

    let mut snapshot = Snapshot::new();
    for (rel, pinned) in frontier {
        let rev = match pinned {
            Some(rev) => rev,
            None => match store.get(&spec.path.join(&ResourcePath::new(rel.clone()))).await {
                Ok(item) => revision(&item).unwrap_or_else(|| content_revision(&item)),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            },
        };
        snapshot.insert(ItemKey::new(rel.join("/")), rev);
    }
    Ok(snapshot)
}

async fn read_item(store: &dyn ResourceStore, spec: &WatchSpec, key: &ItemKey) -> StoreResult<Value> {
    let rel = key.to_path()?;
    store.get(&spec.path.join(&rel)).await
}

/// Emit `ItemAdded` for every key, skipping items that vanished meanwhile
///
/// Keys whose event went out are pushed to `delivered`, so a caller that
/// hits an error halfway knows which ones not to announce again.
async fn emit_added<'a>(
    store: &dyn ResourceStore,
    spec: &WatchSpec,
    keys: impl IntoIterator<Item = &'a ItemKey>,
    events: &mpsc::UnboundedSender<ChangeEvent>,
    delivered: &mut Vec<ItemKey>,
) -> StoreResult<bool> {
    for key in keys {
        let item = match read_item(store, spec, key).await {
            Ok(item) => item,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };
        let event = ChangeEvent::ItemAdded {
            key: key.clone(),
            item,
        };
        if events.send(event).is_err() {
            return Ok(false);
        }
        delivered.push(key.clone());
    }
    Ok(true)
}

async fn poll_loop(
    store: Arc<dyn ResourceStore>,
    spec: WatchSpec,
    mut current: Snapshot,
    interval: Duration,
    events: mpsc::UnboundedSender<ChangeEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let next = match read_snapshot(store.as_ref(), &spec).await {
            Ok(next) => next,
            Err(err) => {
                warn!(path = %spec.path, error = %err, "Poll failed");
                continue;
            }
        };
        let diff = current.diff(&next);
        if diff.is_empty() {
            continue;
        }

        let mut delivered = Vec::new();
        match emit_added(store.as_ref(), &spec, &diff.added, &events, &mut delivered).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                // Delivered keys count as seen; the rest of the diff is retried
                warn!(path = %spec.path, error = %err, "Failed to read added item");
                for key in delivered {
                    if let Some(rev) = next.get(&key) {
                        current.insert(key, rev);
                    }
                }
                continue;
            }
        }
        let rest = diff
            .changed
            .into_iter()
            .map(|key| ChangeEvent::ItemChanged { key })
            .chain(diff.removed.into_iter().map(|key| ChangeEvent::ItemRemoved { key }));
        let mut open = true;
        for event in rest {
            if events.send(event).is_err() {
                open = false;
                break;
            }
        }
        if !open {
            break;
        }
        current = next;
    }
    debug!(path = %spec.path, "Poll loop stopped");
}

#[async_trait]
impl ChangeFeed for PollingFeed {
    async fn subscribe(&self, spec: WatchSpec) -> StoreResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let initial = read_snapshot(self.store.as_ref(), &spec).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        if spec.replay_existing {
            emit_added(self.store.as_ref(), &spec, initial.keys(), &tx, &mut Vec::new()).await?;
        }
        debug!(watch = id, path = %spec.path, items = initial.len(), "Polling watch started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let path = spec.path.clone();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.store),
            spec,
            initial,
            self.interval,
            tx,
            stop_rx,
        ));
        let closer = PollingUnsubscribe {
            stop: stop_tx,
            handle,
        };
        Ok(Subscription::new(id, path, rx, Box::new(closer)))
    }
}

struct PollingUnsubscribe {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

#[async_trait]
impl Unsubscribe for PollingUnsubscribe {
    async fn unsubscribe(self: Box<Self>, _id: u64) -> StoreResult<()> {
        // The loop may already have exited on its own
        let _ = self.stop.send(());
        self.handle
            .await
            .map_err(|e| StoreError::Task(e.to_string()))
    }
}
