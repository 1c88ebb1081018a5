//! Semantic response cache.
//!
//! Deduplicates paraphrased questions: two queries whose embeddings sit at or
//! above the similarity threshold share one cached response, even with zero
//! text overlap.
//!
//! Two-phase lookup keeps the common case cheap:
//! 1. exact path — digest of the normalized query, checked against the cache
//!    client directly (no embedding call);
//! 2. similarity path — embed the query (itself cache-aside through the
//!    vector store's embedding function) and linearly scan a bounded working
//!    set of previously cached query embeddings. The scan cost is
//!    O(capacity), not O(all history); recall degrades once distinct
//!    questions exceed the cap, which is accepted behavior.
//!
//! Eviction is capacity-bounded, oldest-first, applied on write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::CacheClient;
use crate::config::SemanticConfig;
use crate::embedding::cosine_similarity;
use crate::keys;
use crate::store::VectorStore;

/// Key space for exact-match entries, separate from the response namespace.
const KEY_SPACE: &str = "semantic";

/// A cached query with its embedding and response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticCacheRecord {
    pub query: String,
    pub query_hash: String,
    pub embedding: Vec<f32>,
    pub response: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time view of the semantic cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticStats {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cached_queries: usize,
    pub similarity_threshold: f32,
}

pub struct SemanticCache {
    store: Arc<VectorStore>,
    cache: Arc<CacheClient>,
    capacity: usize,
    threshold: f32,
    ttl: Duration,
    working: RwLock<Vec<SemanticCacheRecord>>,
    counters: Counters,
}

impl SemanticCache {
    pub fn new(store: Arc<VectorStore>, cache: Arc<CacheClient>, config: &SemanticConfig) -> Self {
        Self {
            store,
            cache,
            capacity: config.capacity.max(1),
            threshold: config.similarity_threshold,
            ttl: Duration::from_secs(config.ttl_secs),
            working: RwLock::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Look up a response for this query or a paraphrase of it.
    pub async fn get(&self, query: &str) -> Option<Value> {
        let query_hash = keys::hash_text(query);

        // Phase 1: exact match, no embedding call.
        if let Some(response) = self.get_exact(&query_hash).await {
            self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
            debug!(query = %truncated(query), "semantic cache exact hit");
            return Some(response);
        }

        // Phase 2: embedding similarity over the working set. An
        // unembeddable query is a miss, never an error.
        let embedding = match self.store.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "semantic cache could not embed query; miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if let Some((response, similarity)) = self.find_similar(&embedding) {
            self.counters.semantic_hits.fetch_add(1, Ordering::Relaxed);
            info!(
                similarity,
                query = %truncated(query),
                "semantic cache similarity hit"
            );
            return Some(response);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn get_exact(&self, query_hash: &str) -> Option<Value> {
        let key = format!("{}:{}", KEY_SPACE, query_hash);
        if let Some(raw) = self.cache.get_raw(&key).await {
            match serde_json::from_str::<SemanticCacheRecord>(&raw) {
                Ok(record) => return Some(record.response),
                Err(e) => {
                    warn!(key, error = %e, "malformed semantic cache entry; treating as miss");
                }
            }
        }

        // Working set doubles as the exact-match fallback during an outage.
        let working = self.working.read().unwrap();
        working
            .iter()
            .find(|r| r.query_hash == query_hash)
            .map(|r| r.response.clone())
    }

    /// Best match at or above the threshold, if any.
    fn find_similar(&self, embedding: &[f32]) -> Option<(Value, f32)> {
        let working = self.working.read().unwrap();
        let mut best: Option<(&SemanticCacheRecord, f32)> = None;

        for record in working.iter() {
            let similarity = cosine_similarity(embedding, &record.embedding);
            if similarity >= self.threshold
                && best.map_or(true, |(_, s)| similarity > s)
            {
                best = Some((record, similarity));
            }
        }

        best.map(|(record, similarity)| (record.response.clone(), similarity))
    }

    /// Cache a query and its response. Embedding failure means the entry is
    /// simply not cached.
    pub async fn set(&self, query: &str, response: &Value) {
        let embedding = match self.store.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "could not embed query for semantic caching; skipping");
                return;
            }
        };

        let record = SemanticCacheRecord {
            query: query.to_string(),
            query_hash: keys::hash_text(query),
            embedding,
            response: response.clone(),
            created_at: Utc::now(),
        };

        let key = format!("{}:{}", KEY_SPACE, record.query_hash);
        match serde_json::to_string(&record) {
            Ok(raw) => self.cache.set_raw(&key, &raw, self.ttl).await,
            Err(e) => warn!(error = %e, "failed to serialize semantic cache record"),
        }

        let mut working = self.working.write().unwrap();
        if let Some(existing) = working
            .iter_mut()
            .find(|r| r.query_hash == record.query_hash)
        {
            *existing = record;
        } else {
            working.push(record);
        }
        // Oldest-first eviction once over capacity. Entries are appended in
        // arrival order, so the front is the oldest.
        while working.len() > self.capacity {
            working.remove(0);
        }
    }

    /// Drop a specific query from both the cache client and the working set.
    pub async fn invalidate(&self, query: &str) {
        let query_hash = keys::hash_text(query);
        self.cache
            .remove_raw(&format!("{}:{}", KEY_SPACE, query_hash))
            .await;
        let mut working = self.working.write().unwrap();
        working.retain(|r| r.query_hash != query_hash);
    }

    /// Drop everything and reset counters.
    pub fn clear(&self) {
        self.working.write().unwrap().clear();
        self.counters.exact_hits.store(0, Ordering::Relaxed);
        self.counters.semantic_hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SemanticStats {
        let exact_hits = self.counters.exact_hits.load(Ordering::Relaxed);
        let semantic_hits = self.counters.semantic_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = exact_hits + semantic_hits + misses;
        let hit_rate = if total > 0 {
            (exact_hits + semantic_hits) as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        SemanticStats {
            exact_hits,
            semantic_hits,
            misses,
            hit_rate,
            cached_queries: self.working.read().unwrap().len(),
            similarity_threshold: self.threshold,
        }
    }
}

fn truncated(query: &str) -> String {
    query.chars().take(50).collect()
}
