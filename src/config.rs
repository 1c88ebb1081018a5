use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
}

/// Remote cache connection and resilience settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Base URL of the REST cache service. None = in-process fallback only.
    #[serde(default)]
    pub url: Option<String>,
    /// Bearer token for the cache service.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_cache_timeout_secs")]
    pub timeout_secs: u64,
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a half-open trial.
    #[serde(default = "default_recovery_secs")]
    pub recovery_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_min_ms")]
    pub retry_min_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_fallback_capacity")]
    pub fallback_capacity: usize,
    #[serde(default = "default_fallback_ttl_secs")]
    pub fallback_ttl_secs: u64,
    #[serde(default)]
    pub ttl: TtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: default_cache_timeout_secs(),
            failure_threshold: default_failure_threshold(),
            recovery_secs: default_recovery_secs(),
            max_attempts: default_max_attempts(),
            retry_min_ms: default_retry_min_ms(),
            retry_max_ms: default_retry_max_ms(),
            fallback_capacity: default_fallback_capacity(),
            fallback_ttl_secs: default_fallback_ttl_secs(),
            ttl: TtlConfig::default(),
        }
    }
}

fn default_cache_timeout_secs() -> u64 {
    2
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_min_ms() -> u64 {
    100
}
fn default_retry_max_ms() -> u64 {
    2000
}
fn default_fallback_capacity() -> usize {
    1000
}
fn default_fallback_ttl_secs() -> u64 {
    300
}

/// Per-namespace TTLs, in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct TtlConfig {
    #[serde(default = "default_ttl_response")]
    pub response: u64,
    #[serde(default = "default_ttl_validation")]
    pub validation: u64,
    #[serde(default = "default_ttl_rerank")]
    pub rerank: u64,
    #[serde(default = "default_ttl_transform")]
    pub transform: u64,
    #[serde(default = "default_ttl_embedding")]
    pub embedding: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            response: default_ttl_response(),
            validation: default_ttl_validation(),
            rerank: default_ttl_rerank(),
            transform: default_ttl_transform(),
            embedding: default_ttl_embedding(),
        }
    }
}

fn default_ttl_response() -> u64 {
    3600
}
fn default_ttl_validation() -> u64 {
    86_400
}
fn default_ttl_rerank() -> u64 {
    86_400
}
fn default_ttl_transform() -> u64 {
    604_800
}
fn default_ttl_embedding() -> u64 {
    604_800
}

/// Vector store backend selection and connection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    /// `"qdrant"` or `"local"`.
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_vector_timeout_secs")]
    pub timeout_secs: u64,
    /// Snapshot file for the local backend.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            url: None,
            api_key: None,
            collection: default_collection(),
            timeout_secs: default_vector_timeout_secs(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_vector_backend() -> String {
    "local".to_string()
}
fn default_collection() -> String {
    "documents".to_string()
}
fn default_vector_timeout_secs() -> u64 {
    30
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/vectors.json")
}

/// Embedding provider settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"openai"`, or `"ollama"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Search thresholds and iterative-retrieval limits.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum cosine similarity for the primary search path.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Lower threshold used by the relaxed fallback search.
    #[serde(default = "default_relaxed_threshold")]
    pub relaxed_threshold: f32,
    #[serde(default = "default_relaxed_top_k")]
    pub relaxed_top_k: usize,
    /// Cap on query-reformulation iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            relaxed_threshold: default_relaxed_threshold(),
            relaxed_top_k: default_relaxed_top_k(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.6
}
fn default_relaxed_threshold() -> f32 {
    0.4
}
fn default_relaxed_top_k() -> usize {
    10
}
fn default_max_iterations() -> usize {
    3
}

/// Chunker sizing parameters, in characters.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
    /// Sections at or above this size are sub-split by the sliding window.
    #[serde(default = "default_section_max_size")]
    pub section_max_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_chunk_overlap(),
            section_max_size: default_section_max_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    1500
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_section_max_size() -> usize {
    2000
}

/// Query planner marker lists and canned replies.
///
/// The engine is product-agnostic: deployment config supplies the markers
/// that identify product-specific questions. With an empty marker list the
/// domain-specific rule simply never fires.
#[derive(Debug, Deserialize, Clone)]
pub struct PlannerConfig {
    /// Markers that pin a question to the product (brand names, API path
    /// prefixes, auth header names).
    #[serde(default)]
    pub domain_markers: Vec<String>,
    /// Generic-topic vocabulary answered from general knowledge, no retrieval.
    #[serde(default = "default_generic_markers")]
    pub generic_markers: Vec<String>,
    #[serde(default = "default_greeting_reply")]
    pub greeting_reply: String,
    #[serde(default = "default_thanks_reply")]
    pub thanks_reply: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            domain_markers: Vec::new(),
            generic_markers: default_generic_markers(),
            greeting_reply: default_greeting_reply(),
            thanks_reply: default_thanks_reply(),
        }
    }
}

fn default_generic_markers() -> Vec<String> {
    [
        "partial fill",
        "pnl",
        "unrealized",
        "unrealised",
        "kill switch",
        "throttle",
        "cross-margin",
        "cross margin",
        "isolated margin",
        "liquidation",
        "slippage",
        "risk engine",
        "risk management",
        "trading strategy",
        "automate",
        "automation",
        "algorithm",
        "algorithmic",
        "backtest",
        "backtesting",
        "design a bot",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_greeting_reply() -> String {
    "Hey! Ask me about the API, code examples, or errors.".to_string()
}

fn default_thanks_reply() -> String {
    "You're welcome! Let me know if you need anything else.".to_string()
}

/// Semantic cache bounds.
#[derive(Debug, Deserialize, Clone)]
pub struct SemanticConfig {
    #[serde(default = "default_semantic_capacity")]
    pub capacity: usize,
    /// Cosine similarity at or above which two queries share a response.
    #[serde(default = "default_semantic_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_semantic_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            capacity: default_semantic_capacity(),
            similarity_threshold: default_semantic_threshold(),
            ttl_secs: default_semantic_ttl_secs(),
        }
    }
}

fn default_semantic_capacity() -> usize {
    1000
}
fn default_semantic_threshold() -> f32 {
    0.95
}
fn default_semantic_ttl_secs() -> u64 {
    86_400
}

pub fn load_config(path: &Path) -> Result<Config, EngineError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| EngineError::Config(format!("failed to parse config file: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), EngineError> {
    if config.chunking.chunk_size == 0 {
        return Err(EngineError::Config("chunking.chunk_size must be > 0".into()));
    }

    if config.retrieval.top_k == 0 {
        return Err(EngineError::Config("retrieval.top_k must be >= 1".into()));
    }

    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        return Err(EngineError::Config(
            "retrieval.similarity_threshold must be in [0.0, 1.0]".into(),
        ));
    }

    if config.retrieval.relaxed_threshold > config.retrieval.similarity_threshold {
        return Err(EngineError::Config(
            "retrieval.relaxed_threshold must not exceed retrieval.similarity_threshold".into(),
        ));
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            return Err(EngineError::Config(format!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            )));
        }
        if config.embedding.model.is_none() {
            return Err(EngineError::Config(format!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            )));
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => {
            return Err(EngineError::Config(format!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            )))
        }
    }

    match config.vector.backend.as_str() {
        "local" => {}
        "qdrant" => {
            if config.vector.url.is_none() {
                return Err(EngineError::Config(
                    "vector.url must be set when vector.backend is 'qdrant'".into(),
                ));
            }
        }
        other => {
            return Err(EngineError::Config(format!(
                "Unknown vector backend: '{}'. Must be qdrant or local.",
                other
            )))
        }
    }

    if !(0.0..=1.0).contains(&config.semantic.similarity_threshold) {
        return Err(EngineError::Config(
            "semantic.similarity_threshold must be in [0.0, 1.0]".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults_from_empty_config() {
        let f = write_config("");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.cache.failure_threshold, 5);
        assert_eq!(config.cache.recovery_secs, 30);
        assert_eq!(config.cache.fallback_capacity, 1000);
        assert_eq!(config.chunking.chunk_size, 1500);
        assert_eq!(config.retrieval.max_iterations, 3);
        assert_eq!(config.vector.backend, "local");
        assert!((config.semantic.similarity_threshold - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn test_qdrant_requires_url() {
        let f = write_config("[vector]\nbackend = \"qdrant\"\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let f = write_config("[embedding]\nprovider = \"openai\"\n");
        assert!(load_config(f.path()).is_err());

        let f = write_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        );
        assert!(load_config(f.path()).is_ok());
    }

    #[test]
    fn test_relaxed_threshold_must_be_lower() {
        let f = write_config(
            "[retrieval]\nsimilarity_threshold = 0.5\nrelaxed_threshold = 0.8\n",
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let f = write_config("[vector]\nbackend = \"pinecone\"\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_planner_markers_parse() {
        let f = write_config(
            "[planner]\ndomain_markers = [\"acme\", \"/api/v1\", \"x-acme-auth\"]\n",
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.planner.domain_markers.len(), 3);
        assert!(!config.planner.generic_markers.is_empty());
    }
}
