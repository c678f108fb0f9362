//! Change notifications delivered by a watch

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ItemKey;

/// One change to an item of a watched collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// A new item appeared; carries its full representation
    ItemAdded { key: ItemKey, item: Value },

    /// An existing item changed; the item must be fetched
    ItemChanged { key: ItemKey },

    /// An item disappeared from the collection
    ItemRemoved { key: ItemKey },
}

impl ChangeEvent {
    /// Key of the affected item
    #[inline]
    #[must_use]
    pub fn key(&self) -> &ItemKey {
        match self {
            Self::ItemAdded { key, .. } | Self::ItemChanged { key } | Self::ItemRemoved { key } => {
                key
            }
        }
    }

    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ItemAdded { .. } => "added",
            Self::ItemChanged { .. } => "changed",
            Self::ItemRemoved { .. } => "removed",
        }
    }
}
