//! Crate-wide error type.
//!
//! Only two conditions are ever surfaced to callers of the engine: embedding
//! failure on the live query path and vector-backend failure after retries
//! are exhausted. Everything else (cache misses, open breakers, malformed
//! cached payloads) is absorbed at the component boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Embedding generation failed after exhausting retries.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// Vector backend call failed after exhausting retries.
    #[error("vector backend error: {0}")]
    Backend(String),

    /// Remote cache backend call failed. Never escapes the cache client.
    #[error("cache backend error: {0}")]
    Cache(String),

    /// Invalid or incomplete configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local index snapshot could not be read or written.
    #[error("snapshot io error: {0}")]
    Snapshot(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
