//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAiProvider`]** — calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Both HTTP providers accept a single text or a batch and return one
//! fixed-dimension vector per input, in input order. Retry strategy for
//! transient errors (HTTP 429, 5xx, network failures) follows the shared
//! [`RetryPolicy`] backoff schedule; other client errors fail immediately.
//!
//! Also provides [`cosine_similarity`], used by the local index backend and
//! the semantic cache.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::retry::RetryPolicy;
use crate::config::EmbeddingConfig;
use crate::error::EngineError;

/// Trait for embedding providers.
///
/// The embedding API is an external collaborator: the engine only relies on
/// this contract, so tests substitute deterministic doubles.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError>;
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>, EngineError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAiProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => Err(EngineError::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        Err(EngineError::Embedding(
            "embedding provider is disabled".into(),
        ))
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable unless a custom `url`
/// is configured (proxies and compatible gateways often skip auth).
pub struct OpenAiProvider {
    http: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EngineError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EngineError::Config("embedding.model required for OpenAI provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| EngineError::Config("embedding.dims required for OpenAI provider".into()))?;

        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && config.url.is_none() {
            return Err(EngineError::Config(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            retry: retry_policy(config),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut attempt = 0u32;
        let mut last_err: Option<EngineError> = None;

        while attempt < self.retry.max_attempts() {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
            attempt += 1;

            let mut req = self
                .http
                .post(format!("{}/v1/embeddings", self.url))
                .json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: OpenAiResponse = response.json().await?;
                        return order_openai(parsed, texts.len());
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    // Rate limited or server error: retry. Other client
                    // errors will not get better on a second attempt.
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EngineError::Embedding(format!(
                            "embedding API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }
                    return Err(EngineError::Embedding(format!(
                        "embedding API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EngineError::Embedding(format!(
                        "embedding request failed: {}",
                        e
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::Embedding("embedding failed after retries".into())))
    }
}

fn order_openai(parsed: OpenAiResponse, expected: usize) -> Result<Vec<Vec<f32>>, EngineError> {
    if parsed.data.len() != expected {
        return Err(EngineError::Embedding(format!(
            "embedding API returned {} vectors for {} inputs",
            parsed.data.len(),
            expected
        )));
    }
    let mut data = parsed.data;
    // Sort by index to guarantee order matches input.
    data.sort_by_key(|e| e.index);
    Ok(data.into_iter().map(|e| e.embedding).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled.
pub struct OllamaProvider {
    http: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EngineError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| EngineError::Config("embedding.model required for Ollama provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| EngineError::Config("embedding.dims required for Ollama provider".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            retry: retry_policy(config),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut attempt = 0u32;
        let mut last_err: Option<EngineError> = None;

        while attempt < self.retry.max_attempts() {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
            attempt += 1;

            let resp = self
                .http
                .post(format!("{}/api/embed", self.url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: OllamaResponse = response.json().await?;
                        if parsed.embeddings.len() != texts.len() {
                            return Err(EngineError::Embedding(format!(
                                "embedding API returned {} vectors for {} inputs",
                                parsed.embeddings.len(),
                                texts.len()
                            )));
                        }
                        return Ok(parsed.embeddings);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(EngineError::Embedding(format!(
                            "embedding API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }
                    return Err(EngineError::Embedding(format!(
                        "embedding API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(EngineError::Embedding(format!(
                        "embedding request failed (is Ollama running at {}?): {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::Embedding("embedding failed after retries".into())))
    }
}

fn retry_policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_retries.max(1),
        Duration::from_millis(500),
        Duration::from_secs(8),
    )
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn openai_config(server_url: &str, retries: u32) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "openai".into(),
            model: Some("text-embedding-3-small".into()),
            dims: Some(3),
            url: Some(server_url.to_string()),
            max_retries: retries,
            timeout_secs: 5,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_disabled_provider_errors() {
        let provider = DisabledProvider;
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(provider.embed(&["x".to_string()]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_openai_batch_preserves_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                // Deliberately out of order: the provider must sort by index.
                then.status(200).json_body(serde_json::json!({
                    "data": [
                        {"index": 1, "embedding": [0.0, 1.0, 0.0]},
                        {"index": 0, "embedding": [1.0, 0.0, 0.0]},
                    ]
                }));
            })
            .await;

        let provider = OpenAiProvider::new(&openai_config(&server.base_url(), 1)).unwrap();
        let out = provider
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(out[1], vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_openai_retries_server_errors() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(500).body("overloaded");
            })
            .await;

        let provider = OpenAiProvider::new(&openai_config(&server.base_url(), 2)).unwrap();
        let err = provider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EngineError::Embedding(_)));
        assert_eq!(failing.hits_async().await, 2);
    }

    #[tokio::test]
    async fn test_openai_client_error_fails_fast() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/embeddings");
                then.status(400).body("bad model");
            })
            .await;

        let provider = OpenAiProvider::new(&openai_config(&server.base_url(), 3)).unwrap();
        assert!(provider.embed(&["x".to_string()]).await.is_err());
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn test_ollama_embed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(serde_json::json!({
                    "embeddings": [[0.5, 0.5, 0.0]]
                }));
            })
            .await;

        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(3),
            url: Some(server.base_url()),
            ..EmbeddingConfig::default()
        };
        let provider = OllamaProvider::new(&config).unwrap();
        let out = provider.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(out, vec![vec![0.5, 0.5, 0.0]]);
    }
}
