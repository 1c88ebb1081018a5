//! Core data models used throughout the retrieval engine.
//!
//! These types represent the chunks, vector records, and search results that
//! flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A retrieval-sized fragment of a source document, tagged with its heading
/// ancestry (e.g. `"API > Orders > Create"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Chunk text, prefixed with the heading path when one exists.
    pub text: String,
    /// Heading ancestry joined with `" > "`; empty for heading-less documents.
    pub heading_path: String,
    /// Identifier of the source document.
    pub source_id: String,
    /// Zero-based position of this chunk within the source document.
    pub chunk_index: usize,
    /// Number of chunks the source document produced.
    pub total_chunks: usize,
}

/// A point ready for upsert into a vector backend.
///
/// The id is derived from the source document and chunk position, so
/// re-ingesting the same document overwrites rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    /// Payload carries the chunk text under `"document"` plus all chunk
    /// metadata (heading path, source id, chunk index).
    pub payload: serde_json::Value,
}

/// A document returned from a similarity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub text: String,
    pub metadata: serde_json::Value,
    pub similarity: f32,
    pub distance: f32,
}

impl RetrievedDocument {
    pub fn new(text: String, metadata: serde_json::Value, similarity: f32) -> Self {
        Self {
            text,
            metadata,
            similarity,
            distance: 1.0 - similarity,
        }
    }
}

/// One turn of conversation history, used for response-cache key context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

impl Turn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Logical cache namespaces, each with its own key prefix and TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    Response,
    Validation,
    Rerank,
    Transform,
    Embedding,
}

impl CacheNamespace {
    /// Wire-level key prefix for this namespace.
    pub fn prefix(self) -> &'static str {
        match self {
            CacheNamespace::Response => "response",
            CacheNamespace::Validation => "relevancy",
            CacheNamespace::Rerank => "rerank",
            CacheNamespace::Transform => "transform",
            CacheNamespace::Embedding => "embedding",
        }
    }
}

/// Reference to a source document included in a query outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    pub similarity: f32,
}

/// The assembled result of a query, cacheable as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// Name of the plan that produced this outcome.
    pub plan: String,
}
