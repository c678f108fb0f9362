//! Change feed boundary
//!
//! A [`ChangeFeed`] turns a watched collection into a stream of
//! [`ChangeEvent`]s. The stream is owned by a [`Subscription`], which must
//! be closed explicitly so errors from tearing the watch down surface to
//! the caller.

use async_trait::async_trait;
use ruleflow_core::{ChangeEvent, ItemsPattern, ResourcePath};
use tokio::sync::mpsc;

use crate::error::StoreResult;

/// What to watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    /// Collection root
    pub path: ResourcePath,
    /// Where items live below `path`
    pub items: ItemsPattern,
    /// Emit `ItemAdded` for every item present when the watch starts
    pub replay_existing: bool,
}

impl WatchSpec {
    /// Watch direct children of `path`, without replay
    #[must_use]
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            items: ItemsPattern::direct(),
            replay_existing: false,
        }
    }

    /// With items pattern
    #[must_use]
    pub fn with_items(mut self, items: ItemsPattern) -> Self {
        self.items = items;
        self
    }

    /// With replay of existing items
    #[must_use]
    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay_existing = replay;
        self
    }
}

/// Source of change events
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start watching
    ///
    /// A collection that does not exist yet is watched as empty.
    async fn subscribe(&self, spec: WatchSpec) -> StoreResult<Subscription>;
}

/// Tears down the producing side of a subscription
#[async_trait]
pub trait Unsubscribe: Send {
    /// Stop producing events for subscription `id`
    async fn unsubscribe(self: Box<Self>, id: u64) -> StoreResult<()>;
}

/// Live watch handle
///
/// Dropping a subscription stops delivery silently; [`close`](Self::close)
/// stops it and reports failures.
pub struct Subscription {
    id: u64,
    path: ResourcePath,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    closer: Box<dyn Unsubscribe>,
}

impl Subscription {
    /// Create a subscription from its event stream and closer
    pub fn new(
        id: u64,
        path: ResourcePath,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        closer: Box<dyn Unsubscribe>,
    ) -> Self {
        Self {
            id,
            path,
            events,
            closer,
        }
    }

    /// Subscription identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Watched collection
    #[inline]
    #[must_use]
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Next event, or `None` once the feed has stopped
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Stop the watch
    ///
    /// # Errors
    /// Whatever the feed reports while tearing the watch down
    pub async fn close(mut self) -> StoreResult<()> {
        self.events.close();
        self.closer.unsubscribe(self.id).await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
