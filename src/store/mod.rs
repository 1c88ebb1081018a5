//! Vector similarity store.
//!
//! The [`VectorBackend`] trait abstracts over two interchangeable storage
//! implementations — a managed Qdrant collection and a local flat index with
//! snapshot persistence. Backend selection happens once at construction and
//! is invisible to callers; both honor identical threshold and ordering
//! semantics (which [`VectorStore`] additionally enforces store-side).
//!
//! [`VectorStore`] also owns the embedding path: every single-text and batch
//! embedding call is cache-aside through the cache client's `embedding`
//! namespace, and a batch with partial cache hits only calls the provider
//! for the uncached subset, reassembling results in input order.

pub mod local;
pub mod qdrant;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheClient;
use crate::config::{Config, RetrievalConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::EngineError;
use crate::keys;
use crate::models::{DocumentChunk, RetrievedDocument, VectorRecord};

use local::LocalIndexBackend;
use qdrant::QdrantBackend;

/// Abstract vector index backend.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Idempotent by record id: re-upserting overwrites, never duplicates.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), EngineError>;

    /// Return documents with `similarity >= threshold`, best first, at most
    /// `limit` of them.
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedDocument>, EngineError>;

    async fn clear(&self) -> Result<(), EngineError>;

    async fn count(&self) -> Result<usize, EngineError>;

    fn name(&self) -> &'static str;
}

/// Health snapshot for the external stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub backend: &'static str,
    pub documents: usize,
    pub reachable: bool,
}

pub struct VectorStore {
    backend: Arc<dyn VectorBackend>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<CacheClient>,
    retrieval: RetrievalConfig,
    batch_size: usize,
}

impl VectorStore {
    /// Select and connect the configured backend.
    ///
    /// A managed backend that cannot be reached at startup degrades to the
    /// local index with a logged warning — never a hard crash. The decision
    /// is made here, once, through explicit results rather than exceptions.
    pub async fn connect(
        config: &Config,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<CacheClient>,
    ) -> Self {
        let dims = config.embedding.dims.unwrap_or(provider.dims());

        let backend: Arc<dyn VectorBackend> = if config.vector.backend == "qdrant" {
            match QdrantBackend::connect(&config.vector, dims).await {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    warn!(
                        error = %e,
                        "qdrant backend unreachable; falling back to local index"
                    );
                    Arc::new(LocalIndexBackend::open(&config.vector.snapshot_path))
                }
            }
        } else {
            Arc::new(LocalIndexBackend::open(&config.vector.snapshot_path))
        };

        info!(backend = backend.name(), "vector store ready");
        Self {
            backend,
            provider,
            cache,
            retrieval: config.retrieval.clone(),
            batch_size: config.embedding.batch_size,
        }
    }

    /// Build a store over an explicit backend (used by tests).
    pub fn with_backend(
        backend: Arc<dyn VectorBackend>,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<CacheClient>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            backend,
            provider,
            cache,
            retrieval,
            batch_size: crate::config::EmbeddingConfig::default().batch_size,
        }
    }

    // ==================== Embedding (cache-aside) ====================

    /// Embed one text, consulting the embedding cache first.
    ///
    /// This is the engine's single embedding function: the semantic cache
    /// reuses it rather than keeping an embedding cache of its own.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        if let Some(cached) = self.cache.get_embedding(text).await {
            debug!("embedding cache hit");
            return Ok(cached);
        }

        let mut vectors = self.provider.embed(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| EngineError::Embedding("empty embedding response".into()))?;
        self.cache.set_embedding(text, &vector).await;
        Ok(vector)
    }

    /// Embed a batch, calling the provider only for cache misses and
    /// reassembling results in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut pending: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get_embedding(text).await {
                Some(cached) => results[i] = Some(cached),
                None => pending.push(i),
            }
        }

        if !pending.is_empty() {
            for batch in pending.chunks(self.max_batch()) {
                let batch_texts: Vec<String> =
                    batch.iter().map(|&i| texts[i].clone()).collect();
                let vectors = self.provider.embed(&batch_texts).await?;
                if vectors.len() != batch.len() {
                    return Err(EngineError::Embedding(format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    )));
                }
                for (&i, vector) in batch.iter().zip(vectors) {
                    self.cache.set_embedding(&texts[i], &vector).await;
                    results[i] = Some(vector);
                }
            }
        }

        Ok(results.into_iter().map(|v| v.unwrap_or_default()).collect())
    }

    fn max_batch(&self) -> usize {
        self.batch_size.max(1)
    }

    // ==================== Ingestion ====================

    /// Embed chunks in batches and upsert them into the backend.
    ///
    /// Record ids are derived from `(source_id, chunk_index)`, so
    /// re-ingesting a document overwrites its previous records.
    pub async fn add_chunks(&self, chunks: &[DocumentChunk]) -> Result<usize, EngineError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embed_batch(&texts).await?;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, vector)| {
                let chunk_id = keys::hash_text(&format!("{}#{}", chunk.source_id, chunk.chunk_index));
                VectorRecord {
                    id: Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string(),
                    vector,
                    payload: serde_json::json!({
                        "document": chunk.text,
                        "original_id": chunk_id,
                        "heading_path": chunk.heading_path,
                        "source_id": chunk.source_id,
                        "chunk_index": chunk.chunk_index,
                        "total_chunks": chunk.total_chunks,
                    }),
                }
            })
            .collect();

        let added = records.len();
        self.backend
            .upsert(records)
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;
        info!(added, backend = self.backend.name(), "added chunks to vector store");
        Ok(added)
    }

    // ==================== Search ====================

    /// Primary search: similarity at or above the configured threshold,
    /// sorted descending, truncated to `top_k`.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedDocument>, EngineError> {
        let limit = top_k.unwrap_or(self.retrieval.top_k);
        self.search_at(query, limit, self.retrieval.similarity_threshold)
            .await
    }

    /// Relaxed fallback search with the lower context threshold. Never the
    /// primary path — used when the primary search keeps coming up empty.
    pub async fn search_relaxed(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedDocument>, EngineError> {
        let limit = top_k.unwrap_or(self.retrieval.relaxed_top_k);
        self.search_at(query, limit, self.retrieval.relaxed_threshold)
            .await
    }

    async fn search_at(
        &self,
        query: &str,
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedDocument>, EngineError> {
        let vector = self.embed_query(query).await?;
        let mut results = self.backend.search(&vector, limit, threshold).await?;

        // Backends agree on these semantics, but enforce them here so a
        // misbehaving backend cannot leak below-threshold or unsorted rows.
        results.retain(|doc| doc.similarity >= threshold);
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        debug!(
            query = %query.chars().take(50).collect::<String>(),
            found = results.len(),
            threshold,
            "vector search complete"
        );
        Ok(results)
    }

    // ==================== Maintenance ====================

    pub async fn clear(&self) -> Result<(), EngineError> {
        self.backend.clear().await
    }

    pub async fn count(&self) -> Result<usize, EngineError> {
        self.backend.count().await
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn health(&self) -> StoreHealth {
        match self.backend.count().await {
            Ok(documents) => StoreHealth {
                backend: self.backend.name(),
                documents,
                reachable: true,
            },
            Err(_) => StoreHealth {
                backend: self.backend.name(),
                documents: 0,
                reachable: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic provider double: vectors come from a lookup table.
    pub(crate) struct TableProvider {
        table: std::collections::HashMap<String, Vec<f32>>,
        default: Vec<f32>,
        pub calls: AtomicUsize,
        pub texts_embedded: AtomicUsize,
    }

    impl TableProvider {
        pub fn new(entries: &[(&str, Vec<f32>)], default: Vec<f32>) -> Self {
            Self {
                table: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                default,
                calls: AtomicUsize::new(0),
                texts_embedded: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for TableProvider {
        fn model_name(&self) -> &str {
            "table"
        }
        fn dims(&self) -> usize {
            self.default.len()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| self.table.get(t).cloned().unwrap_or(self.default.clone()))
                .collect())
        }
    }

    fn store_with(
        provider: Arc<TableProvider>,
    ) -> (tempfile::TempDir, VectorStore, Arc<CacheClient>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheClient::in_process_only(&CacheConfig::default()));
        let backend = Arc::new(LocalIndexBackend::open(dir.path().join("vectors.json")));
        let store = VectorStore::with_backend(
            backend,
            provider,
            cache.clone(),
            RetrievalConfig::default(),
        );
        (dir, store, cache)
    }

    fn chunk(source_id: &str, index: usize, total: usize, text: &str) -> DocumentChunk {
        DocumentChunk {
            text: text.to_string(),
            heading_path: String::new(),
            source_id: source_id.to_string(),
            chunk_index: index,
            total_chunks: total,
        }
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let provider = Arc::new(TableProvider::new(
            &[
                ("orders doc", vec![1.0, 0.0]),
                ("auth doc", vec![0.0, 1.0]),
                ("find orders", vec![0.95, 0.05]),
            ],
            vec![0.5, 0.5],
        ));
        let (_dir, store, _cache) = store_with(provider);

        store
            .add_chunks(&[
                chunk("d1", 0, 2, "orders doc"),
                chunk("d1", 1, 2, "auth doc"),
            ])
            .await
            .unwrap();

        let results = store.search("find orders", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "orders doc");
        assert_eq!(results[0].metadata["source_id"], "d1");
    }

    #[tokio::test]
    async fn test_threshold_invariant_and_relaxed_superset() {
        let provider = Arc::new(TableProvider::new(
            &[
                ("strong", vec![1.0, 0.0]),
                ("weak", vec![0.5, 0.866]),
                ("q", vec![1.0, 0.0]),
            ],
            vec![0.0, 1.0],
        ));
        let (_dir, store, _cache) = store_with(provider);
        store
            .add_chunks(&[chunk("d", 0, 2, "strong"), chunk("d", 1, 2, "weak")])
            .await
            .unwrap();

        let strict = store.search("q", Some(10)).await.unwrap();
        for doc in &strict {
            assert!(doc.similarity >= 0.6);
        }

        let relaxed = store.search_relaxed("q", Some(10)).await.unwrap();
        assert!(relaxed.len() >= strict.len());
        let strict_texts: Vec<&str> = strict.iter().map(|d| d.text.as_str()).collect();
        for text in strict_texts {
            assert!(relaxed.iter().any(|d| d.text == text));
        }
    }

    #[tokio::test]
    async fn test_embedding_memoized_across_calls() {
        let provider = Arc::new(TableProvider::new(&[], vec![1.0, 0.0]));
        let (_dir, store, _cache) = store_with(provider.clone());

        store.embed_query("same question").await.unwrap();
        store.embed_query("same question").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_partial_hits_only_embed_missing() {
        let provider = Arc::new(TableProvider::new(
            &[("a", vec![1.0, 0.0]), ("b", vec![0.0, 1.0])],
            vec![0.5, 0.5],
        ));
        let (_dir, store, _cache) = store_with(provider.clone());

        // Prime the cache for "a" only.
        store.embed_query("a").await.unwrap();
        assert_eq!(provider.texts_embedded.load(Ordering::SeqCst), 1);

        let out = store
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![1.0, 0.0]);
        assert_eq!(out[1], vec![0.0, 1.0]);
        // Only "b" went to the provider on the second call.
        assert_eq!(provider.texts_embedded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reingest_overwrites_by_id() {
        let provider = Arc::new(TableProvider::new(&[], vec![1.0, 0.0]));
        let (_dir, store, _cache) = store_with(provider);

        store.add_chunks(&[chunk("d1", 0, 1, "version one")]).await.unwrap();
        store.add_chunks(&[chunk("d1", 0, 1, "version two")]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let results = store.search("anything", None).await.unwrap();
        assert_eq!(results[0].text, "version two");
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        struct FailingProvider;

        #[async_trait]
        impl EmbeddingProvider for FailingProvider {
            fn model_name(&self) -> &str {
                "failing"
            }
            fn dims(&self) -> usize {
                2
            }
            async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
                Err(EngineError::Embedding("quota exhausted".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheClient::in_process_only(&CacheConfig::default()));
        let backend = Arc::new(LocalIndexBackend::open(dir.path().join("v.json")));
        let store = VectorStore::with_backend(
            backend,
            Arc::new(FailingProvider),
            cache,
            RetrievalConfig::default(),
        );

        let err = store.search("q", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_payload_round_trip_metadata() {
        let provider = Arc::new(TableProvider::new(&[], vec![1.0, 0.0]));
        let (_dir, store, _cache) = store_with(provider);

        let mut c = chunk("guide", 2, 5, "body text");
        c.heading_path = "API > Orders".to_string();
        store.add_chunks(&[c]).await.unwrap();

        let results = store.search("body text", None).await.unwrap();
        let meta = &results[0].metadata;
        assert_eq!(meta["heading_path"], "API > Orders");
        assert_eq!(meta["source_id"], "guide");
        assert_eq!(meta["chunk_index"], json!(2));
        assert_eq!(meta["total_chunks"], json!(5));
    }
}
