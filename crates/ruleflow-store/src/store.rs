//! Resource store boundary

use std::sync::Arc;

use async_trait::async_trait;
use ruleflow_core::{ResourceId, ResourcePath, Tree};
use serde_json::Value;

use crate::error::StoreResult;

/// Hierarchical JSON document store
///
/// Paths address documents, sub-documents and, through the `_meta`
/// segment, a resource's metadata document. Links (`{"_id": ...}`) are
/// followed transparently when a path crosses them.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Read the document at `path`
    ///
    /// # Errors
    /// `StoreError::NotFound` if nothing exists at `path`
    async fn get(&self, path: &ResourcePath) -> StoreResult<Value>;

    /// Whether something exists at `path`
    async fn head(&self, path: &ResourcePath) -> StoreResult<bool>;

    /// Merge `data` into the document at `path`
    ///
    /// Missing levels are created; levels the `tree` marks as resources
    /// (`_type` present) become separate resources linked into place.
    async fn put(&self, path: &ResourcePath, data: Value, tree: Option<&Tree>)
        -> StoreResult<()>;

    /// Create a standalone resource and return its id
    async fn create(&self, data: Value) -> StoreResult<ResourceId>;
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn get(&self, path: &ResourcePath) -> StoreResult<Value> {
        (**self).get(path).await
    }

    async fn head(&self, path: &ResourcePath) -> StoreResult<bool> {
        (**self).head(path).await
    }

    async fn put(
        &self,
        path: &ResourcePath,
        data: Value,
        tree: Option<&Tree>,
    ) -> StoreResult<()> {
        (**self).put(path, data, tree).await
    }

    async fn create(&self, data: Value) -> StoreResult<ResourceId> {
        (**self).create(data).await
    }
}
