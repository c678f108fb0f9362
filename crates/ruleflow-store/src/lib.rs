//! ruleflow store
//!
//! Boundaries the engine talks to, and their implementations:
//! - [`ResourceStore`]: read, check, write and create documents
//! - [`ChangeFeed`]: watch a collection as a stream of change events
//! - [`MemoryStore`]: in-process store that is also a change feed
//! - [`HttpStore`]: store reached over HTTP
//! - [`PollingFeed`]: change feed over any store

pub mod error;
pub mod feed;
pub mod http;
pub mod memory;
pub mod polling;
pub mod snapshot;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use feed::{ChangeFeed, Subscription, Unsubscribe, WatchSpec};
pub use http::HttpStore;
pub use memory::MemoryStore;
pub use polling::{read_snapshot, PollingFeed};
pub use snapshot::{Snapshot, SnapshotDiff};
pub use store::ResourceStore;
