//! The uniform health/stats shape every backend reports through (spec
//! §4.11), independent of which concrete `StorageBackend` is configured.

use serde::Serialize;
use std::collections::HashMap;

use crate::embedding::EmbeddingCacheStats;
use crate::storage::{HealthStatus, StorageStats};

/// `get_stats()` response shape, identical across backends (spec §4.11).
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub backend: &'static str,
    pub storage_type: String,
    pub total_memories: i64,
    pub total_tags: i64,
    pub storage_size: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub healthy: bool,
    pub details: HashMap<String, String>,
}

/// `check_database_health()` response: a health probe plus the same stats
/// shape, so dimension mismatches and backend-specific detail surface in one
/// place (S6).
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub stats: EngineStats,
}

/// Render a byte count as a human-readable size string ("14.2 MB").
pub fn human_readable_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.1} {}", size, UNITS[unit_idx])
    }
}

/// Assemble the canonical stats shape from a backend's raw `StorageStats`
/// plus embedding cache observability (spec §4.11, SPEC_FULL §2 "embedding
/// cache statistics").
pub fn build_stats(
    backend: &'static str,
    storage_type: impl Into<String>,
    stats: StorageStats,
    cache_stats: Option<EmbeddingCacheStats>,
) -> EngineStats {
    let mut details = stats.details;
    if let Some(cache) = cache_stats {
        details.insert("embedding_cache_hits".to_string(), cache.hits.to_string());
        details.insert("embedding_cache_misses".to_string(), cache.misses.to_string());
        details.insert(
            "embedding_cache_hit_rate".to_string(),
            format!("{:.2}", cache.hit_rate),
        );
        details.insert("embedding_cache_entries".to_string(), cache.entries.to_string());
    }

    EngineStats {
        backend,
        storage_type: storage_type.into(),
        total_memories: stats.total_memories,
        total_tags: stats.total_tags,
        storage_size: stats
            .storage_size_bytes
            .map(human_readable_size)
            .unwrap_or_else(|| "unknown".to_string()),
        embedding_model: stats.embedding_model,
        embedding_dimension: stats.embedding_dimension,
        healthy: stats.healthy,
        details,
    }
}

pub fn build_report(health: HealthStatus, stats: EngineStats) -> HealthReport {
    HealthReport {
        healthy: health.healthy && stats.healthy,
        latency_ms: health.latency_ms,
        error: health.error,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes_human_readable() {
        assert_eq!(human_readable_size(500), "500 B");
        assert_eq!(human_readable_size(14_200_000), "13.5 MB");
    }

    #[test]
    fn report_is_unhealthy_if_either_side_is() {
        let health = HealthStatus { healthy: true, latency_ms: 1.0, error: None, details: HashMap::new() };
        let stats = EngineStats {
            backend: "embedded",
            storage_type: "sqlite".into(),
            total_memories: 0,
            total_tags: 0,
            storage_size: "0 B".into(),
            embedding_model: "local".into(),
            embedding_dimension: 384,
            healthy: false,
            details: HashMap::new(),
        };
        assert!(!build_report(health, stats).healthy);
    }
}
