//! # Retrieval Harness
//!
//! A resilient retrieval and caching engine for documentation Q&A services.
//!
//! Given a natural-language question, the engine decides how much expensive
//! work (embedding calls, model calls, similarity search) is actually
//! required, fetches the smallest sufficient set of relevant document
//! fragments, and avoids repeating identical or near-identical work across
//! requests and across process restarts.
//!
//! ## Architecture
//!
//! ```text
//! question ──▶ ┌─────────┐    ┌──────────────┐    ┌─────────────┐
//!              │ Planner │───▶│ Exact cache  │───▶│ Semantic    │
//!              └─────────┘    │ (namespaced) │    │ cache       │
//!                   │         └──────────────┘    └──────┬──────┘
//!              canned/fact                               │ miss
//!              short-circuit   ┌──────────────┐   ┌──────▼──────┐
//!                              │ Qdrant/local │◀──│ VectorStore │
//!                              │   backend    │   │ (cache-aside│
//!                              └──────────────┘   │  embedding) │
//!                                                 └──────┬──────┘
//!                              ┌──────────────┐          │
//!                              │ QueryHooks   │◀─────────┘
//!                              │ (external    │   validate/rerank/
//!                              │  LLM seams)  │   generate
//!                              └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use retrieval_harness::{load_config, PassthroughHooks, RetrievalEngine};
//!
//! # async fn run() -> Result<(), retrieval_harness::EngineError> {
//! let config = load_config(std::path::Path::new("engine.toml"))?;
//! let engine = RetrievalEngine::connect(config, Arc::new(PassthroughHooks)).await?;
//!
//! engine.ingest_dir(std::path::Path::new("docs/")).await?;
//! let outcome = engine.query("how do I authenticate?", &[], None, None).await;
//! println!("{}", outcome.answer);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`chunk`] | Heading-aware document chunking |
//! | [`keys`] | Normalization and cache-key digests |
//! | [`cache`] | Resilient namespaced cache client |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Dual-backend vector similarity store |
//! | [`semantic`] | Embedding-similarity response cache |
//! | [`planner`] | Query classification and execution plans |
//! | [`pipeline`] | Retrieval orchestration and ingestion |
//! | [`stats`] | Stats/health snapshots |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod keys;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod semantic;
pub mod stats;
pub mod store;

pub use config::{load_config, Config};
pub use error::EngineError;
pub use models::{DocumentChunk, QueryOutcome, RetrievedDocument, Turn, VectorRecord};
pub use pipeline::{PassthroughHooks, QueryHooks, RetrievalEngine};
pub use planner::{ExecutionPlan, QueryPlanner, QueryType};
