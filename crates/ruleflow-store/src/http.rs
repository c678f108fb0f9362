//! HTTP resource store
//!
//! Talks to a hypermedia store API: `GET`/`HEAD`/`PUT` on paths, `POST
//! /resources` to create. Every request carries the bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LOCATION, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Response, StatusCode};
use ruleflow_core::json::{is_link, link};
use ruleflow_core::{ResourceId, ResourcePath, Revision, Tree};
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};
use crate::store::ResourceStore;

const JSON: &str = "application/json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource store reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpStore {
    /// Create a store client for `base_url`, authenticating with `token`
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> StoreResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Base URL requests are made against
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &ResourcePath) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(path: &ResourcePath, response: Response) -> StoreResult<Response> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Http {
                status: status.as_u16(),
                path: path.clone(),
                body,
            });
        }
        Ok(response)
    }

    async fn put_raw(&self, path: &ResourcePath, data: &Value, content_type: &str) -> StoreResult<()> {
        trace!(path = %path, "PUT");
        let response = self
            .client
            .put(self.url(path))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, content_type)
            .body(serde_json::to_vec(data)?)
            .send()
            .await?;
        Self::check(path, response).await?;
        Ok(())
    }

    /// Create the resources `tree` calls for on the way to `path`
    ///
    /// Levels that already exist are left alone.
    async fn ensure_tree(&self, path: &ResourcePath, tree: &Tree, upto: usize) -> StoreResult<()> {
        let segments = path.segments();
        for len in 1..=upto {
            let prefix = ResourcePath::new(segments[..len].to_vec());
            let Some(level) = tree.descend(prefix.iter()).filter(Tree::is_resource) else {
                continue;
            };
            if self.head(&prefix).await? {
                continue;
            }
            let content_type = level.content_type().unwrap_or(JSON).to_string();
            let id = self.create(json!({ "_type": content_type })).await?;
            let pinned = level.is_versioned().then_some(Revision(0));
            debug!(path = %prefix, id = %id, "Materialised tree level");
            self.put_raw(&prefix, &link(&id, pinned), &content_type)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for HttpStore {
    async fn get(&self, path: &ResourcePath) -> StoreResult<Value> {
        trace!(path = %path, "GET");
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = Self::check(path, response).await?;
        Ok(response.json().await?)
    }

    async fn head(&self, path: &ResourcePath) -> StoreResult<bool> {
        let response = self
            .client
            .head(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match Self::check(path, response).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn put(
        &self,
        path: &ResourcePath,
        data: Value,
        tree: Option<&Tree>,
    ) -> StoreResult<()> {
        let mut content_type = JSON.to_string();
        if let Some(tree) = tree {
            // A link is placed by the final PUT itself
            let upto = if is_link(&data) {
                path.len().saturating_sub(1)
            } else {
                path.len()
            };
            self.ensure_tree(path, tree, upto).await?;
            if let Some(ct) = tree.descend(path.iter()).and_then(|l| l.content_type().map(String::from)) {
                content_type = ct;
            }
        }
        self.put_raw(path, &data, &content_type).await
    }

    async fn create(&self, data: Value) -> StoreResult<ResourceId> {
        let path = ResourcePath::single("resources");
        let content_type = data
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or(JSON)
            .to_string();
        let response = self
            .client
            .post(self.url(&path))
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, content_type)
            .body(serde_json::to_vec(&data)?)
            .send()
            .await?;
        let response = Self::check(&path, response).await?;

        let location = response
            .headers()
            .get(CONTENT_LOCATION)
            .or_else(|| response.headers().get(LOCATION))
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StoreError::Protocol("create response has no location".into()))?;
        let id = location.trim_start_matches('/').trim_end_matches('/');
        if id.is_empty() {
            return Err(StoreError::Protocol(format!("empty location '{location}'")));
        }
        Ok(ResourceId::new(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let store = HttpStore::new("http://localhost:8080/", "t").unwrap();
        assert_eq!(store.base_url(), "http://localhost:8080");
        assert_eq!(
            store.url(&"/bookmarks/x".parse().unwrap()),
            "http://localhost:8080/bookmarks/x"
        );
    }
}
