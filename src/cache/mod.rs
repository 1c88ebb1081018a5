//! Resilient namespaced cache client.
//!
//! Sits in front of every expensive operation in the engine: responses,
//! relevancy validations, rerank orderings, query transforms, and embeddings
//! each get their own key namespace with one shared hashing/TTL/fallback
//! discipline.
//!
//! Resilience layering, outermost first:
//! 1. the in-process fallback cache answers hot keys without any network;
//! 2. a per-call-type circuit breaker skips the remote entirely while open;
//! 3. calls that pass the breaker run under bounded retry with backoff.
//!
//! `get`/`set` never return errors: every remote failure degrades to a miss
//! (get) or a fallback-only write (set). The engine must stay correct with
//! no remote cache at all, just slower and more expensive.

pub mod backend;
pub mod breaker;
pub mod fallback;
pub mod retry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::keys;
use crate::models::{CacheNamespace, RetrievedDocument, Turn};

use backend::{CacheBackend, RestCacheBackend};
use breaker::CircuitBreaker;
use fallback::FallbackCache;
use retry::RetryPolicy;

/// Counters exposed through the stats/health surface.
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fallback_hits: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fallback_hits: u64,
    pub sets: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub fallback_len: usize,
    pub remote_connected: bool,
}

pub struct CacheClient {
    remote: Option<Arc<dyn CacheBackend>>,
    fallback: FallbackCache,
    get_breaker: CircuitBreaker,
    set_breaker: CircuitBreaker,
    retry: RetryPolicy,
    ttl: crate::config::TtlConfig,
    counters: Counters,
}

impl CacheClient {
    /// Build a client from config: REST remote when `cache.url` is set,
    /// fallback-only otherwise.
    pub fn new(config: &CacheConfig) -> Self {
        let remote: Option<Arc<dyn CacheBackend>> = match &config.url {
            Some(_) => match RestCacheBackend::new(config) {
                Ok(b) => Some(Arc::new(b)),
                Err(e) => {
                    warn!(error = %e, "remote cache unavailable; using in-process fallback only");
                    None
                }
            },
            None => None,
        };
        Self::assemble(remote, config)
    }

    /// Build a client over an explicit backend (used by tests and embedders).
    pub fn with_backend(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self::assemble(Some(backend), config)
    }

    /// Fallback-only client, no remote at all.
    pub fn in_process_only(config: &CacheConfig) -> Self {
        Self::assemble(None, config)
    }

    fn assemble(remote: Option<Arc<dyn CacheBackend>>, config: &CacheConfig) -> Self {
        Self {
            remote,
            fallback: FallbackCache::new(
                config.fallback_capacity,
                Duration::from_secs(config.fallback_ttl_secs),
            ),
            get_breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.recovery_secs),
            ),
            set_breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.recovery_secs),
            ),
            retry: RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.retry_min_ms),
                Duration::from_millis(config.retry_max_ms),
            ),
            ttl: config.ttl.clone(),
            counters: Counters::default(),
        }
    }

    // ==================== Raw access ====================

    /// Resilient get. Never fails; every degradation is a miss.
    pub(crate) async fn get_raw(&self, key: &str) -> Option<String> {
        if let Some(value) = self.fallback.get(key) {
            self.counters.fallback_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        let Some(remote) = &self.remote else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if !self.get_breaker.try_acquire() {
            debug!(key, "cache circuit open; treating get as miss");
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.retry.run(|| remote.fetch(key)).await {
            Ok(Some(value)) => {
                self.get_breaker.record_success();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.fallback.insert(key, &value);
                Some(value)
            }
            Ok(None) => {
                self.get_breaker.record_success();
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                self.get_breaker.record_failure();
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "cache get failed; degrading to miss");
                None
            }
        }
    }

    /// Resilient set. The fallback cache is always written; the remote write
    /// is best-effort.
    pub(crate) async fn set_raw(&self, key: &str, value: &str, ttl: Duration) {
        self.fallback.insert(key, value);
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        let Some(remote) = &self.remote else {
            return;
        };

        if !self.set_breaker.try_acquire() {
            debug!(key, "cache circuit open; value stored in fallback only");
            return;
        }

        match self.retry.run(|| remote.store(key, value, ttl)).await {
            Ok(()) => self.set_breaker.record_success(),
            Err(e) => {
                self.set_breaker.record_failure();
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "cache set failed; value stored in fallback only");
            }
        }
    }

    /// Best-effort remove from both tiers, for explicit invalidation.
    pub(crate) async fn remove_raw(&self, key: &str) {
        self.fallback.remove(key);

        let Some(remote) = &self.remote else {
            return;
        };
        if !self.set_breaker.try_acquire() {
            return;
        }
        match self.retry.run(|| remote.remove(key)).await {
            Ok(()) => self.set_breaker.record_success(),
            Err(e) => {
                self.set_breaker.record_failure();
                warn!(key, error = %e, "cache remove failed; fallback entry dropped only");
            }
        }
    }

    fn key(ns: CacheNamespace, rest: &str) -> String {
        format!("{}:{}", ns.prefix(), rest)
    }

    fn parse_json<T: serde::de::DeserializeOwned>(&self, key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                // Corrupt or truncated payload: a miss, never an error.
                warn!(key, error = %e, "malformed cached payload; treating as miss");
                None
            }
        }
    }

    fn ttl_for(&self, ns: CacheNamespace) -> Duration {
        let secs = match ns {
            CacheNamespace::Response => self.ttl.response,
            CacheNamespace::Validation => self.ttl.validation,
            CacheNamespace::Rerank => self.ttl.rerank,
            CacheNamespace::Transform => self.ttl.transform,
            CacheNamespace::Embedding => self.ttl.embedding,
        };
        Duration::from_secs(secs)
    }

    // ==================== Response caching ====================

    /// Cached final response for a question under its conversational context.
    pub async fn get_response(
        &self,
        query: &str,
        history: &[Turn],
        side_context: Option<&str>,
    ) -> Option<Value> {
        let key = Self::key(
            CacheNamespace::Response,
            &format!(
                "{}:{}",
                keys::hash_text(query),
                keys::hash_context(history, side_context)
            ),
        );
        let raw = self.get_raw(&key).await?;
        self.parse_json(&key, &raw)
    }

    pub async fn set_response(
        &self,
        query: &str,
        history: &[Turn],
        side_context: Option<&str>,
        response: &Value,
    ) {
        let key = Self::key(
            CacheNamespace::Response,
            &format!(
                "{}:{}",
                keys::hash_text(query),
                keys::hash_context(history, side_context)
            ),
        );
        match serde_json::to_string(response) {
            Ok(value) => {
                self.set_raw(&key, &value, self.ttl_for(CacheNamespace::Response))
                    .await
            }
            Err(e) => warn!(error = %e, "failed to serialize response for caching"),
        }
    }

    // ==================== Validation caching ====================

    /// Cached relevancy verdict for one (query, document) pair.
    pub async fn get_validation(&self, query: &str, doc: &RetrievedDocument) -> Option<bool> {
        let key = Self::key(
            CacheNamespace::Validation,
            &format!("{}:{}", keys::hash_text(query), keys::hash_doc(doc)),
        );
        let raw = self.get_raw(&key).await?;
        self.parse_json(&key, &raw)
    }

    pub async fn set_validation(&self, query: &str, doc: &RetrievedDocument, relevant: bool) {
        let key = Self::key(
            CacheNamespace::Validation,
            &format!("{}:{}", keys::hash_text(query), keys::hash_doc(doc)),
        );
        self.set_raw(
            &key,
            if relevant { "true" } else { "false" },
            self.ttl_for(CacheNamespace::Validation),
        )
        .await;
    }

    // ==================== Rerank caching ====================

    /// Cached rerank ordering (indices into the candidate list).
    pub async fn get_rerank(&self, query: &str, docs: &[RetrievedDocument]) -> Option<Vec<usize>> {
        let key = Self::key(
            CacheNamespace::Rerank,
            &format!("{}:{}", keys::hash_text(query), keys::hash_docs(docs)),
        );
        let raw = self.get_raw(&key).await?;
        self.parse_json(&key, &raw)
    }

    pub async fn set_rerank(&self, query: &str, docs: &[RetrievedDocument], order: &[usize]) {
        let key = Self::key(
            CacheNamespace::Rerank,
            &format!("{}:{}", keys::hash_text(query), keys::hash_docs(docs)),
        );
        match serde_json::to_string(order) {
            Ok(value) => {
                self.set_raw(&key, &value, self.ttl_for(CacheNamespace::Rerank))
                    .await
            }
            Err(e) => warn!(error = %e, "failed to serialize rerank order for caching"),
        }
    }

    // ==================== Transform caching ====================

    /// Cached reformulation of a query.
    pub async fn get_transform(&self, query: &str) -> Option<String> {
        let key = Self::key(CacheNamespace::Transform, &keys::hash_text(query));
        self.get_raw(&key).await
    }

    pub async fn set_transform(&self, query: &str, transformed: &str) {
        let key = Self::key(CacheNamespace::Transform, &keys::hash_text(query));
        self.set_raw(&key, transformed, self.ttl_for(CacheNamespace::Transform))
            .await;
    }

    // ==================== Embedding caching ====================

    /// Cached embedding vector for a text.
    pub async fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::key(CacheNamespace::Embedding, &keys::hash_text(text));
        let raw = self.get_raw(&key).await?;
        self.parse_json(&key, &raw)
    }

    pub async fn set_embedding(&self, text: &str, embedding: &[f32]) {
        let key = Self::key(CacheNamespace::Embedding, &keys::hash_text(text));
        match serde_json::to_string(embedding) {
            Ok(value) => {
                self.set_raw(&key, &value, self.ttl_for(CacheNamespace::Embedding))
                    .await
            }
            Err(e) => warn!(error = %e, "failed to serialize embedding for caching"),
        }
    }

    // ==================== Statistics ====================

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let fallback_hits = self.counters.fallback_hits.load(Ordering::Relaxed);
        let total = hits + fallback_hits + misses;
        let hit_rate = if total > 0 {
            (hits + fallback_hits) as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStats {
            hits,
            misses,
            fallback_hits,
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate,
            fallback_len: self.fallback.len(),
            remote_connected: self.remote.is_some() && !self.get_breaker.is_open(),
        }
    }
}
