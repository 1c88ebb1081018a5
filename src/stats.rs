//! Aggregated stats and health surface.
//!
//! Serializable snapshots consumed by an external health endpoint; the
//! endpoint itself lives outside this crate.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::semantic::SemanticStats;
use crate::store::StoreHealth;

/// One snapshot covering every long-lived engine resource.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub semantic: SemanticStats,
    pub store: StoreHealth,
}
