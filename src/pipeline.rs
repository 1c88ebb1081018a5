//! Retrieval orchestration.
//!
//! [`RetrievalEngine`] composes the planner, caches, and vector store into
//! the full query-handling flow: plan → cache lookups → vector search with
//! iterative reformulation → validation/rerank hooks → answer assembly →
//! write-through caching.
//!
//! The external language model lives behind [`QueryHooks`]; the engine never
//! builds prompts or personas itself. `query` is infallible by design:
//! embedding or backend failure after retries forces the degraded
//! no-context answer path, never a user-facing error.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::cache::CacheClient;
use crate::chunk::chunk_document;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::EngineError;
use crate::models::{QueryOutcome, RetrievedDocument, SourceRef, Turn};
use crate::planner::{QueryPlanner, QueryType};
use crate::semantic::SemanticCache;
use crate::stats::EngineStats;
use crate::store::VectorStore;

/// Query used to pull error-reference material when the question looks like
/// a pasted error log.
const ERROR_BOOST_QUERY: &str = "error codes reference troubleshooting";

/// How many sources a response cites.
const MAX_SOURCES: usize = 3;

/// External LLM collaborator seams.
///
/// Every method is an expensive remote call from the engine's point of view;
/// the orchestrator wraps validation, rerank, and transform calls with
/// cache-aside lookups in their namespaces.
#[async_trait]
pub trait QueryHooks: Send + Sync {
    /// Rewrite a query that retrieved nothing into a better search query.
    async fn transform_query(&self, query: &str) -> Result<String, EngineError>;

    /// Break a long, indirect question into a simpler direct query.
    async fn decompose_query(&self, query: &str) -> Result<String, EngineError>;

    /// Judge whether one retrieved document is relevant to the query.
    async fn validate(&self, query: &str, doc: &RetrievedDocument) -> Result<bool, EngineError>;

    /// Produce a better ordering of the candidates (indices into `docs`).
    async fn rerank(
        &self,
        query: &str,
        docs: &[RetrievedDocument],
    ) -> Result<Vec<usize>, EngineError>;

    /// Generate the final answer from retrieved context.
    async fn generate(
        &self,
        query: &str,
        docs: &[RetrievedDocument],
        history: &[Turn],
        side_context: Option<&str>,
    ) -> Result<String, EngineError>;

    /// Generate without retrieved context (generic-topic and degraded paths).
    async fn generate_general(&self, query: &str, history: &[Turn])
        -> Result<String, EngineError>;
}

/// Hooks implementation with no model behind it: transforms are identity,
/// every document validates, ordering is unchanged, and answers are the
/// retrieved text itself. Useful for tests and offline smoke runs.
pub struct PassthroughHooks;

#[async_trait]
impl QueryHooks for PassthroughHooks {
    async fn transform_query(&self, query: &str) -> Result<String, EngineError> {
        Ok(query.to_string())
    }

    async fn decompose_query(&self, query: &str) -> Result<String, EngineError> {
        Ok(query.to_string())
    }

    async fn validate(&self, _query: &str, _doc: &RetrievedDocument) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn rerank(
        &self,
        _query: &str,
        docs: &[RetrievedDocument],
    ) -> Result<Vec<usize>, EngineError> {
        Ok((0..docs.len()).collect())
    }

    async fn generate(
        &self,
        _query: &str,
        docs: &[RetrievedDocument],
        _history: &[Turn],
        _side_context: Option<&str>,
    ) -> Result<String, EngineError> {
        Ok(docs
            .first()
            .map(|d| d.text.clone())
            .unwrap_or_else(|| "No relevant documentation found.".to_string()))
    }

    async fn generate_general(
        &self,
        _query: &str,
        _history: &[Turn],
    ) -> Result<String, EngineError> {
        Ok("No documentation context available for this question.".to_string())
    }
}

pub struct RetrievalEngine {
    cache: Arc<CacheClient>,
    store: Arc<VectorStore>,
    semantic: SemanticCache,
    planner: QueryPlanner,
    hooks: Arc<dyn QueryHooks>,
    config: Config,
}

impl RetrievalEngine {
    /// Construct the engine from configuration: build the embedding
    /// provider, the cache client, the vector store (with backend fallback),
    /// and the semantic cache, wired together once at process start.
    pub async fn connect(config: Config, hooks: Arc<dyn QueryHooks>) -> Result<Self, EngineError> {
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::from(crate::embedding::create_provider(&config.embedding)?);
        let cache = Arc::new(CacheClient::new(&config.cache));
        let store = Arc::new(VectorStore::connect(&config, provider, cache.clone()).await);
        Ok(Self::from_parts(config, cache, store, hooks))
    }

    /// Assemble from pre-built parts (tests inject doubles here).
    pub fn from_parts(
        config: Config,
        cache: Arc<CacheClient>,
        store: Arc<VectorStore>,
        hooks: Arc<dyn QueryHooks>,
    ) -> Self {
        let semantic = SemanticCache::new(store.clone(), cache.clone(), &config.semantic);
        let planner = QueryPlanner::new(&config.planner);
        Self {
            cache,
            store,
            semantic,
            planner,
            hooks,
            config,
        }
    }

    // ==================== Query flow ====================

    /// Answer a question. Infallible: every failure degrades.
    ///
    /// `fact_hit` is the result of the caller's exact-fact lookup, if any —
    /// the fact store itself is an external collaborator.
    pub async fn query(
        &self,
        question: &str,
        history: &[Turn],
        side_context: Option<&str>,
        fact_hit: Option<&str>,
    ) -> QueryOutcome {
        let plan = self.planner.plan(question, fact_hit);
        debug!(
            plan = plan.query_type.as_str(),
            reason = %plan.reason,
            "query planned"
        );

        // Canned responses skip everything, including the caches.
        if plan.skip_all() && plan.use_canned_response {
            let key = plan.canned_key.as_deref().unwrap_or("greeting");
            info!(plan = plan.query_type.as_str(), "using canned response");
            return QueryOutcome {
                answer: self.planner.canned_response(key).to_string(),
                sources: Vec::new(),
                plan: plan.query_type.as_str().to_string(),
            };
        }

        // An exact-fact hit is the answer verbatim.
        if let Some(fact) = fact_hit {
            info!("fact hit; answering verbatim");
            return QueryOutcome {
                answer: fact.to_string(),
                sources: Vec::new(),
                plan: QueryType::SimpleFact.as_str().to_string(),
            };
        }

        // Exact-match response cache.
        if let Some(cached) = self.cache.get_response(question, history, side_context).await {
            if let Ok(outcome) = serde_json::from_value::<QueryOutcome>(cached) {
                info!("response cache hit");
                return outcome;
            }
        }

        // Semantic cache: paraphrases of already-answered questions.
        if let Some(cached) = self.semantic.get(question).await {
            if let Ok(outcome) = serde_json::from_value::<QueryOutcome>(cached) {
                return outcome;
            }
        }

        // Generic-topic plans answer from general knowledge, no retrieval.
        if plan.skip_retrieval {
            let answer = self.generate_general(question, history).await;
            let outcome = QueryOutcome {
                answer,
                sources: Vec::new(),
                plan: plan.query_type.as_str().to_string(),
            };
            self.write_through(question, history, side_context, &outcome)
                .await;
            return outcome;
        }

        // Retrieval. Embedding or backend failure after retries lands on the
        // degraded no-context path.
        let docs = match self.retrieve(question).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, "retrieval unavailable; answering without context");
                let answer = self.generate_general(question, history).await;
                let outcome = QueryOutcome {
                    answer,
                    sources: Vec::new(),
                    plan: plan.query_type.as_str().to_string(),
                };
                self.write_through(question, history, side_context, &outcome)
                    .await;
                return outcome;
            }
        };

        let docs = if !plan.skip_validation && !docs.is_empty() {
            self.validate_docs(question, docs).await
        } else {
            docs
        };

        let docs = if !plan.skip_rerank && docs.len() > 1 {
            self.rerank_docs(question, docs).await
        } else {
            docs
        };

        let outcome = self
            .assemble(question, history, side_context, &plan, docs)
            .await;
        self.write_through(question, history, side_context, &outcome)
            .await;
        outcome
    }

    /// Search, boosting error logs and escalating through reformulation,
    /// relaxed thresholds, and decomposition when results stay empty.
    async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedDocument>, EngineError> {
        let mut docs = self.store.search(question, None).await?;

        if looks_like_error_log(question) {
            debug!("question looks like an error log; boosting with error-code docs");
            match self.store.search(ERROR_BOOST_QUERY, Some(5)).await {
                Ok(error_docs) => docs = prepend_unique(error_docs, docs),
                Err(e) => warn!(error = %e, "error-doc boost failed"),
            }
        }

        if docs.is_empty() {
            info!("no documents above threshold; trying iterative retrieval");
            docs = self.iterative_retrieval(question).await?;
        }

        if docs.is_empty() {
            info!("trying relaxed-threshold search for context");
            docs = self.store.search_relaxed(question, None).await?;
        }

        if docs.is_empty() && question.split_whitespace().count() > 8 {
            if let Some(decomposed) = self.decompose(question).await {
                if decomposed != question {
                    info!("retrying with decomposed query");
                    docs = self.store.search(&decomposed, None).await?;
                    if docs.is_empty() {
                        docs = self.store.search_relaxed(&decomposed, None).await?;
                    }
                }
            }
        }

        Ok(docs)
    }

    /// Reformulate-and-retry loop. Each reformulation must differ from the
    /// previous query; the identity transform ends the loop early.
    async fn iterative_retrieval(
        &self,
        question: &str,
    ) -> Result<Vec<RetrievedDocument>, EngineError> {
        let mut current = question.to_string();

        for iteration in 1..=self.config.retrieval.max_iterations {
            let Some(transformed) = self.transform_cached(&current).await else {
                break;
            };
            if transformed == current {
                break;
            }
            current = transformed;

            let docs = self.store.search(&current, None).await?;
            if !docs.is_empty() {
                info!(iteration, "found documents after reformulation");
                return Ok(docs);
            }
        }

        debug!(
            max_iterations = self.config.retrieval.max_iterations,
            "iterative retrieval exhausted"
        );
        Ok(Vec::new())
    }

    /// Query transform with cache-aside in the `transform` namespace.
    async fn transform_cached(&self, query: &str) -> Option<String> {
        if let Some(cached) = self.cache.get_transform(query).await {
            return Some(cached);
        }
        match self.hooks.transform_query(query).await {
            Ok(transformed) => {
                self.cache.set_transform(query, &transformed).await;
                Some(transformed)
            }
            Err(e) => {
                warn!(error = %e, "query transform failed");
                None
            }
        }
    }

    async fn decompose(&self, query: &str) -> Option<String> {
        match self.hooks.decompose_query(query).await {
            Ok(decomposed) => Some(decomposed),
            Err(e) => {
                warn!(error = %e, "query decomposition failed");
                None
            }
        }
    }

    /// Relevancy validation with per-document cache-aside. A failed hook
    /// call keeps the document — dropping context on a flaky validator
    /// would hurt more than the occasional irrelevant chunk.
    async fn validate_docs(
        &self,
        question: &str,
        docs: Vec<RetrievedDocument>,
    ) -> Vec<RetrievedDocument> {
        let mut kept = Vec::with_capacity(docs.len());
        for doc in docs {
            let relevant = match self.cache.get_validation(question, &doc).await {
                Some(cached) => cached,
                None => match self.hooks.validate(question, &doc).await {
                    Ok(verdict) => {
                        self.cache.set_validation(question, &doc, verdict).await;
                        verdict
                    }
                    Err(e) => {
                        warn!(error = %e, "validation hook failed; keeping document");
                        true
                    }
                },
            };
            if relevant {
                kept.push(doc);
            }
        }
        kept
    }

    /// Rerank with cache-aside over the candidate set.
    async fn rerank_docs(
        &self,
        question: &str,
        docs: Vec<RetrievedDocument>,
    ) -> Vec<RetrievedDocument> {
        let order = match self.cache.get_rerank(question, &docs).await {
            Some(cached) => cached,
            None => match self.hooks.rerank(question, &docs).await {
                Ok(order) => {
                    self.cache.set_rerank(question, &docs, &order).await;
                    order
                }
                Err(e) => {
                    warn!(error = %e, "rerank hook failed; keeping retrieval order");
                    return docs;
                }
            },
        };
        apply_order(docs, &order)
    }

    async fn assemble(
        &self,
        question: &str,
        history: &[Turn],
        side_context: Option<&str>,
        plan: &crate::planner::ExecutionPlan,
        docs: Vec<RetrievedDocument>,
    ) -> QueryOutcome {
        if docs.is_empty() {
            info!("no relevant documents; generating without context");
            let answer = self.generate_general(question, history).await;
            return QueryOutcome {
                answer,
                sources: Vec::new(),
                plan: plan.query_type.as_str().to_string(),
            };
        }

        let answer = match self
            .hooks
            .generate(question, &docs, history, side_context)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "generation failed; degrading to no-context answer");
                self.generate_general(question, history).await
            }
        };

        let sources = docs
            .iter()
            .take(MAX_SOURCES)
            .map(|doc| SourceRef {
                source_id: doc
                    .metadata
                    .get("source_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                similarity: doc.similarity,
            })
            .collect();

        QueryOutcome {
            answer,
            sources,
            plan: plan.query_type.as_str().to_string(),
        }
    }

    async fn generate_general(&self, question: &str, history: &[Turn]) -> String {
        match self.hooks.generate_general(question, history).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "no-context generation failed");
                "Unable to answer right now; please try again.".to_string()
            }
        }
    }

    /// Write the outcome into both the exact and semantic caches.
    async fn write_through(
        &self,
        question: &str,
        history: &[Turn],
        side_context: Option<&str>,
        outcome: &QueryOutcome,
    ) {
        match serde_json::to_value(outcome) {
            Ok(value) => {
                self.cache
                    .set_response(question, history, side_context, &value)
                    .await;
                self.semantic.set(question, &value).await;
            }
            Err(e) => warn!(error = %e, "failed to serialize outcome for caching"),
        }
    }

    // ==================== Ingestion ====================

    /// Chunk a raw document and add it to the vector store. Re-ingesting the
    /// same `source_id` supersedes the previous chunks.
    pub async fn ingest_text(&self, source_id: &str, text: &str) -> Result<usize, EngineError> {
        let chunks = chunk_document(source_id, text, &self.config.chunking);
        if chunks.is_empty() {
            return Ok(0);
        }
        self.store.add_chunks(&chunks).await
    }

    /// Load and ingest every `.md`/`.txt`/`.rst` file under a directory.
    pub async fn ingest_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let mut files = Vec::new();
        collect_files(dir, &mut files)?;

        let mut total = 0;
        for path in files {
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let source_id = path.display().to_string();
            total += self.ingest_text(&source_id, &content).await?;
            debug!(path = %path.display(), "ingested document");
        }

        info!(chunks = total, dir = %dir.display(), "directory ingestion complete");
        Ok(total)
    }

    // ==================== Surface ====================

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            semantic: self.semantic.stats(),
            store: self.store.health().await,
        }
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn semantic_cache(&self) -> &SemanticCache {
        &self.semantic
    }
}

/// File extensions the directory loader accepts.
const INGEST_EXTENSIONS: &[&str] = &["md", "txt", "rst"];

/// Recursive walk collecting ingestable files in a stable order.
fn collect_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<(), EngineError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| INGEST_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}

static HTTP_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(400|401|403|404|429|500)\b").unwrap());
static NUMERIC_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-\d{4}\b").unwrap());

/// Detect pasted error output (HTTP status codes, JSON error bodies,
/// numeric error codes) so retrieval can pull error-reference docs.
fn looks_like_error_log(question: &str) -> bool {
    let q = question.trim();
    if q.is_empty() || q.len() > 2000 {
        return false;
    }
    if HTTP_STATUS_RE.is_match(q) || NUMERIC_CODE_RE.is_match(q) {
        return true;
    }
    (q.contains("\"code\"") && q.contains("\"msg\"")) || (q.contains("'code'") && q.contains("'msg'"))
}

/// Prepend boost docs that are not already present (first 200 chars as the
/// identity key), keeping boosted context ahead of the original results.
fn prepend_unique(
    boost: Vec<RetrievedDocument>,
    existing: Vec<RetrievedDocument>,
) -> Vec<RetrievedDocument> {
    let key = |doc: &RetrievedDocument| doc.text.chars().take(200).collect::<String>();
    let seen: std::collections::HashSet<String> = existing.iter().map(&key).collect();

    let mut out: Vec<RetrievedDocument> = boost
        .into_iter()
        .filter(|doc| !seen.contains(&key(doc)))
        .collect();
    out.extend(existing);
    out
}

/// Reorder by the given indices, ignoring out-of-range or duplicate entries
/// and appending anything the ordering left out.
fn apply_order(docs: Vec<RetrievedDocument>, order: &[usize]) -> Vec<RetrievedDocument> {
    let mut slots: Vec<Option<RetrievedDocument>> = docs.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(slots.len());

    for &i in order {
        if let Some(slot) = slots.get_mut(i) {
            if let Some(doc) = slot.take() {
                out.push(doc);
            }
        }
    }
    for slot in slots {
        if let Some(doc) = slot {
            out.push(doc);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(text: &str, similarity: f32) -> RetrievedDocument {
        RetrievedDocument::new(text.to_string(), json!({}), similarity)
    }

    #[test]
    fn test_error_log_detection() {
        assert!(looks_like_error_log("request failed with 401"));
        assert!(looks_like_error_log("got -1021 from the api"));
        assert!(looks_like_error_log(r#"{"code": -1111, "msg": "precision"}"#));
        assert!(!looks_like_error_log("how do I place an order"));
        assert!(!looks_like_error_log(""));
    }

    #[test]
    fn test_error_log_length_guard() {
        let huge = "401 ".repeat(1000);
        assert!(!looks_like_error_log(&huge));
    }

    #[test]
    fn test_prepend_unique_dedups() {
        let boost = vec![doc("error codes", 0.9), doc("shared", 0.8)];
        let existing = vec![doc("shared", 0.7), doc("other", 0.6)];
        let merged = prepend_unique(boost, existing);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].text, "error codes");
        assert_eq!(merged[1].text, "shared");
    }

    #[test]
    fn test_apply_order_permutes() {
        let docs = vec![doc("a", 0.9), doc("b", 0.8), doc("c", 0.7)];
        let out = apply_order(docs, &[2, 0, 1]);
        let texts: Vec<&str> = out.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_apply_order_tolerates_bad_indices() {
        let docs = vec![doc("a", 0.9), doc("b", 0.8)];
        let out = apply_order(docs, &[5, 1, 1]);
        let texts: Vec<&str> = out.iter().map(|d| d.text.as_str()).collect();
        // Invalid and duplicate entries are ignored; leftovers appended.
        assert_eq!(texts, vec!["b", "a"]);
    }
}
