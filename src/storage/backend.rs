//! The storage abstraction every backend satisfies (spec §4.4).
//!
//! A capability interface with explicitly enumerated operations, not a
//! duck-typed one: callers depend only on this trait, never on which
//! concrete backend is behind it.

use std::collections::HashMap;

use crate::error::Result;
use crate::types::{ListFilters, Memory, MemoryQueryResult, MetadataPatch};

/// Aggregate, backend-agnostic statistics (spec §4.11's `get_stats` shape,
/// minus the fields the Memory Service adds at response-shaping time).
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub total_memories: i64,
    pub total_tags: i64,
    pub storage_size_bytes: Option<u64>,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub healthy: bool,
    pub details: HashMap<String, String>,
}

/// Result of a health probe.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub details: HashMap<String, String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: 0.0,
            error: None,
            details: HashMap::new(),
        }
    }
}

/// One page of a `list_memories` traversal (spec §4.4 `list`, P6).
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<Memory>,
    pub total: i64,
}

/// The core storage backend trait (spec §4.4).
///
/// # Design
///
/// All methods are synchronous and take `&self`; backends with only async
/// primitives (cloud, federated) run their I/O to completion internally
/// (mirroring the embedding provider's block-on pattern) rather than leaking
/// an async fn into this trait, so callers never care which backend they
/// hold a trait object for.
pub trait StorageBackend: Send + Sync {
    /// Idempotent setup: create schema if absent, verify the stored
    /// embedding dimension (if any) against the configured provider.
    /// Returns `DimensionMismatch` if they disagree (spec §4.5).
    fn initialize(&self) -> Result<()>;

    /// Store a memory. Returns `(stored, message)`; `stored=false` on an
    /// exact content_hash duplicate, which is never an error (I1).
    fn store(&self, memory: Memory) -> Result<(bool, String)>;

    /// Semantic nearest-neighbor retrieval, ranked per I7. May perform
    /// late-embedding of records stored before the provider was ready.
    fn retrieve(&self, query: &str, n: usize, min_similarity: f32) -> Result<Vec<MemoryQueryResult>>;

    /// Tag search. `match_all=true` requires every query tag (I6 AND
    /// semantics); `match_all=false` requires any one of them (OR semantics).
    fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>>;

    /// Inclusive range scan on `created_at`, ordered newest first.
    fn search_by_time(&self, start: f64, end: f64, n: usize) -> Result<Vec<Memory>>;

    /// Nearest neighbors to an existing memory's stored (or late-computed)
    /// embedding, excluding the source record itself.
    fn search_similar_to(&self, content_hash: &str, n: usize) -> Result<Vec<MemoryQueryResult>>;

    /// Delete a memory and its tag/vector relations atomically (I5). Returns
    /// `(deleted, message)`; deleting an absent hash is `deleted=false`, not
    /// an error.
    fn delete(&self, content_hash: &str) -> Result<(bool, String)>;

    /// Delete every memory carrying `tag`. Returns the number deleted.
    fn delete_by_tag(&self, tag: &str) -> Result<usize>;

    /// Apply a metadata patch. `tags`, when present, replaces the tag set
    /// rather than merging with it (spec §9). Bumps `updated_at`.
    fn update_metadata(&self, content_hash: &str, patch: MetadataPatch) -> Result<()>;

    /// Merge records sharing a content_hash, keeping the earliest
    /// `created_at` and the union of their tags. Returns the number merged
    /// away.
    fn cleanup_duplicates(&self) -> Result<usize>;

    /// Cheap aggregate statistics; backends may serve this from a
    /// short-TTL cache.
    fn get_stats(&self) -> Result<StorageStats>;

    /// Paginated listing, stable order by `created_at` descending (P6).
    fn list(&self, offset: usize, limit: usize, filters: ListFilters) -> Result<ListPage>;

    /// Liveness/readiness probe, separate from `get_stats` so it can run on
    /// its own (tighter) timeout budget.
    fn health_check(&self) -> Result<HealthStatus>;

    /// Short label identifying the backend family: "embedded", "cloud", or
    /// "federated".
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_stats_default_is_empty() {
        let stats = StorageStats::default();
        assert_eq!(stats.total_memories, 0);
        assert_eq!(stats.total_tags, 0);
        assert!(!stats.healthy);
    }

    #[test]
    fn health_status_default_is_healthy() {
        let status = HealthStatus::default();
        assert!(status.healthy);
        assert!(status.error.is_none());
    }
}
