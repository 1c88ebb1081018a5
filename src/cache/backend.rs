//! Remote cache backend abstraction.
//!
//! The engine talks to its remote cache through [`CacheBackend`] so the
//! resilience discipline (breaker, retry, fallback) can be exercised against
//! test doubles, and so deployments can swap the transport without touching
//! the client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::CacheConfig;
use crate::error::EngineError;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a value by key. `Ok(None)` is a clean miss.
    async fn fetch(&self, key: &str) -> Result<Option<String>, EngineError>;

    /// Store a value with an explicit TTL.
    async fn store(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<(), EngineError>;

    fn name(&self) -> &'static str;
}

/// REST key/value cache backend (Redis-over-HTTP style).
///
/// Wire contract: `GET {base}/get/{key}` returns `{"result": <string|null>}`;
/// `POST {base}/set/{key}?ex={ttl_secs}` with the raw value as the body.
/// Authentication is a bearer token.
pub struct RestCacheBackend {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct GetResponse {
    result: Option<String>,
}

impl RestCacheBackend {
    pub fn new(config: &CacheConfig) -> Result<Self, EngineError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| EngineError::Config("cache.url is required for the REST backend".into()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl CacheBackend for RestCacheBackend {
    async fn fetch(&self, key: &str) -> Result<Option<String>, EngineError> {
        let url = format!("{}/get/{}", self.base_url, key);
        let response = self.authorize(self.http.get(&url)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Cache(format!(
                "cache get failed ({}): {}",
                status, body
            )));
        }

        let body: GetResponse = response.json().await?;
        Ok(body.result)
    }

    async fn store(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError> {
        let url = format!("{}/set/{}", self.base_url, key);
        let response = self
            .authorize(self.http.post(&url))
            .query(&[("ex", ttl.as_secs().to_string())])
            .body(value.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Cache(format!(
                "cache set failed ({}): {}",
                status, body
            )));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), EngineError> {
        let url = format!("{}/del/{}", self.base_url, key);
        let response = self.authorize(self.http.post(&url)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Cache(format!(
                "cache del failed ({}): {}",
                status, body
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn backend_for(server: &MockServer) -> RestCacheBackend {
        let config = CacheConfig {
            url: Some(server.base_url()),
            token: Some("secret".into()),
            ..CacheConfig::default()
        };
        RestCacheBackend::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_hit() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/get/response:abc:def")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(serde_json::json!({"result": "{\"answer\":\"hi\"}"}));
            })
            .await;

        let backend = backend_for(&server);
        let value = backend.fetch("response:abc:def").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"answer\":\"hi\"}"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_miss_is_none_not_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/missing");
                then.status(200).json_body(serde_json::json!({"result": null}));
            })
            .await;

        let backend = backend_for(&server);
        assert!(backend.fetch("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_sends_ttl() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/set/embedding:abc")
                    .query_param("ex", "3600")
                    .body("[0.1,0.2]");
                then.status(200).json_body(serde_json::json!({"result": "OK"}));
            })
            .await;

        let backend = backend_for(&server);
        backend
            .store("embedding:abc", "[0.1,0.2]", Duration::from_secs(3600))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_surfaces_as_cache_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/get/k");
                then.status(500).body("boom");
            })
            .await;

        let backend = backend_for(&server);
        let err = backend.fetch("k").await.unwrap_err();
        assert!(matches!(err, EngineError::Cache(_)));
    }
}
