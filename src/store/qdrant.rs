//! Managed vector-database backend speaking the Qdrant REST wire contract.
//!
//! One collection per deployment, cosine distance, fixed dimension. Upserts
//! are idempotent by point id; searches carry the similarity threshold so
//! filtering happens server-side. Point ids are UUIDv5 values derived from
//! the content-derived chunk ids, so the same chunk always lands on the same
//! point.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::VectorConfig;
use crate::error::EngineError;
use crate::models::{RetrievedDocument, VectorRecord};

use super::VectorBackend;

/// Points are upserted in batches of this size.
const UPSERT_BATCH: usize = 100;

pub struct QdrantBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<usize>,
}

impl QdrantBackend {
    /// Connect to the collection, creating it if absent. Fails when the
    /// service is unreachable — the caller decides whether to fall back.
    pub async fn connect(config: &VectorConfig, dims: usize) -> Result<Self, EngineError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| EngineError::Config("vector.url required for qdrant backend".into()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let backend = Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            collection: config.collection.clone(),
        };

        backend.ensure_collection(dims).await?;
        let count = backend.point_count().await?;
        info!(
            collection = %backend.collection,
            documents = count,
            "connected to qdrant collection"
        );
        Ok(backend)
    }

    fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("api-key", key),
            None => req,
        }
    }

    async fn ensure_collection(&self, dims: usize) -> Result<(), EngineError> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let body = serde_json::json!({
            "vectors": {
                "size": dims,
                "distance": "Cosine",
            }
        });

        let response = self.request(self.http.put(&url)).json(&body).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                // An existing collection is fine; anything else is not.
                if text.contains("already exists") {
                    debug!(collection = %self.collection, "collection already exists");
                    return Ok(());
                }
                Err(EngineError::Backend(format!(
                    "qdrant collection error ({}): {}",
                    status, text
                )))
            }
        }
    }

    async fn point_count(&self) -> Result<usize, EngineError> {
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let response = self.request(self.http.get(&url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend(format!(
                "qdrant collection info failed ({}): {}",
                status, text
            )));
        }
        let info: CollectionInfoResponse = response.json().await?;
        Ok(info.result.points_count.unwrap_or(0))
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), EngineError> {
        if records.is_empty() {
            return Ok(());
        }

        let url = format!("{}/collections/{}/points", self.base_url, self.collection);
        let total_batches = records.len().div_ceil(UPSERT_BATCH);

        for (i, batch) in records.chunks(UPSERT_BATCH).enumerate() {
            let points: Vec<serde_json::Value> = batch
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "vector": r.vector,
                        "payload": r.payload,
                    })
                })
                .collect();

            let response = self
                .request(self.http.put(&url))
                .query(&[("wait", "true")])
                .json(&serde_json::json!({ "points": points }))
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(EngineError::Backend(format!(
                    "qdrant upsert failed ({}): {}",
                    status, text
                )));
            }
            debug!(batch = i + 1, total_batches, "upserted qdrant batch");
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedDocument>, EngineError> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );
        let body = serde_json::json!({
            "vector": vector,
            "limit": limit,
            "score_threshold": threshold,
            "with_payload": true,
        });

        let response = self.request(self.http.post(&url)).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend(format!(
                "qdrant search failed ({}): {}",
                status, text
            )));
        }

        let parsed: SearchResponse = response.json().await?;
        let results = parsed
            .result
            .into_iter()
            .filter_map(|point| {
                let mut payload = point.payload?;
                let text = payload.get("document")?.as_str()?.to_string();
                if let Some(obj) = payload.as_object_mut() {
                    obj.remove("document");
                }
                Some(RetrievedDocument::new(text, payload, point.score))
            })
            .collect();
        Ok(results)
    }

    async fn clear(&self) -> Result<(), EngineError> {
        // Drop and recreate: cheaper than deleting points one by one, and it
        // leaves the collection configured exactly as before.
        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let dims = self.current_dims().await?;

        let response = self.request(self.http.delete(&url)).send().await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Backend(format!(
                "qdrant collection delete failed ({}): {}",
                status, text
            )));
        }

        self.ensure_collection(dims).await
    }

    async fn count(&self) -> Result<usize, EngineError> {
        self.point_count().await
    }

    fn name(&self) -> &'static str {
        "qdrant"
    }
}

impl QdrantBackend {
    /// Vector size of the live collection, for recreate-after-clear.
    async fn current_dims(&self) -> Result<usize, EngineError> {
        #[derive(Deserialize)]
        struct Info {
            result: InfoResult,
        }
        #[derive(Deserialize)]
        struct InfoResult {
            config: InfoConfig,
        }
        #[derive(Deserialize)]
        struct InfoConfig {
            params: InfoParams,
        }
        #[derive(Deserialize)]
        struct InfoParams {
            vectors: VectorParams,
        }
        #[derive(Deserialize)]
        struct VectorParams {
            size: usize,
        }

        let url = format!("{}/collections/{}", self.base_url, self.collection);
        let response = self.request(self.http.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Backend(
                "qdrant collection info unavailable".into(),
            ));
        }
        let info: Info = response.json().await?;
        Ok(info.result.config.params.vectors.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn config_for(server: &MockServer) -> VectorConfig {
        VectorConfig {
            backend: "qdrant".into(),
            url: Some(server.base_url()),
            api_key: Some("qd-key".into()),
            collection: "docs".into(),
            ..VectorConfig::default()
        }
    }

    async fn mock_collection_info(server: &MockServer, points: usize) {
        server
            .mock_async(move |when, then| {
                when.method(GET).path("/collections/docs");
                then.status(200).json_body(json!({
                    "result": {
                        "points_count": points,
                        "config": {"params": {"vectors": {"size": 4}}}
                    }
                }));
            })
            .await;
    }

    #[tokio::test]
    async fn test_connect_creates_collection() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/docs")
                    .header("api-key", "qd-key");
                then.status(200).json_body(json!({"result": true}));
            })
            .await;
        mock_collection_info(&server, 0).await;

        let backend = QdrantBackend::connect(&config_for(&server), 4).await.unwrap();
        assert_eq!(backend.name(), "qdrant");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let config = VectorConfig {
            backend: "qdrant".into(),
            url: Some("http://127.0.0.1:1".into()),
            timeout_secs: 1,
            ..VectorConfig::default()
        };
        assert!(QdrantBackend::connect(&config, 4).await.is_err());
    }

    #[tokio::test]
    async fn test_search_maps_payload() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs");
                then.status(200).json_body(json!({"result": true}));
            })
            .await;
        mock_collection_info(&server, 2).await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/docs/points/search")
                    .json_body_partial(r#"{"limit": 5, "score_threshold": 0.6}"#);
                then.status(200).json_body(json!({
                    "result": [
                        {"score": 0.91, "payload": {"document": "chunk text", "source_id": "doc1"}},
                    ]
                }));
            })
            .await;

        let backend = QdrantBackend::connect(&config_for(&server), 4).await.unwrap();
        let results = backend.search(&[0.1, 0.2, 0.3, 0.4], 5, 0.6).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "chunk text");
        assert_eq!(results[0].metadata["source_id"], "doc1");
        assert!((results[0].distance - 0.09).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_upsert_posts_points() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs");
                then.status(200).json_body(json!({"result": true}));
            })
            .await;
        mock_collection_info(&server, 0).await;
        let upsert = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/collections/docs/points")
                    .query_param("wait", "true");
                then.status(200).json_body(json!({"result": {"status": "completed"}}));
            })
            .await;

        let backend = QdrantBackend::connect(&config_for(&server), 4).await.unwrap();
        backend
            .upsert(vec![VectorRecord {
                id: "9f1a7e3c-0000-5000-8000-000000000001".into(),
                vector: vec![0.1, 0.2, 0.3, 0.4],
                payload: json!({"document": "text", "source_id": "doc1"}),
            }])
            .await
            .unwrap();
        upsert.assert_async().await;
    }

    #[tokio::test]
    async fn test_search_error_propagates() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/docs");
                then.status(200).json_body(json!({"result": true}));
            })
            .await;
        mock_collection_info(&server, 0).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/docs/points/search");
                then.status(500).body("index corrupted");
            })
            .await;

        let backend = QdrantBackend::connect(&config_for(&server), 4).await.unwrap();
        let err = backend.search(&[0.1], 5, 0.6).await.unwrap_err();
        assert!(matches!(err, EngineError::Backend(_)));
    }
}
