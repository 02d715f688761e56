//! The Memory Service (spec §4.8): the single entry point every transport
//! calls. Owns hostname tagging, input validation, content hashing, and
//! response shaping; holds no backend-specific state of its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::embedding::Embedder;
use crate::error::{EngramError, Result};
use crate::health::{self, EngineStats, HealthReport};
use crate::identity;
use crate::query;
use crate::storage::{ListPage, StorageBackend};
use crate::types::{ListFilters, Memory, MemoryQueryResult, MetadataPatch};

/// Where `retrieve_memory`/tag/time results ended up: reused across the
/// response shapes in spec §4.8.
#[derive(Debug, Clone, Serialize)]
pub struct StoreMemoryResponse {
    pub success: bool,
    pub message: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveMemoryResponse {
    pub results: Vec<MemoryQueryResult>,
    pub total_found: usize,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchByTagResponse {
    pub results: Vec<Memory>,
    pub search_tags: Vec<String>,
    pub match_all: bool,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchByTimeResponse {
    pub results: Vec<Memory>,
    pub start: f64,
    pub end: f64,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchSimilarResponse {
    pub results: Vec<MemoryQueryResult>,
    pub source_hash: String,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListMemoriesResponse {
    pub results: Vec<Memory>,
    pub total: i64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteMemoryResponse {
    pub success: bool,
    pub message: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteByTagResponse {
    pub success: bool,
    pub deleted_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateMetadataResponse {
    pub success: bool,
    pub content_hash: String,
}

/// Either a natural-language time expression or an explicit epoch-second
/// range (spec §6.1 `search_by_time(query_string | {start, end}, ...)`).
pub enum TimeQuery {
    Natural(String),
    Range { start: f64, end: f64 },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Whether writes get tagged with `source:<hostname>` / `hostname:<hostname>`
    /// (spec §4.8).
    pub hostname_tagging_enabled: bool,
    /// Label surfaced in `get_stats().backend` ("embedded", "cloud", "federated").
    pub backend_label: &'static str,
    /// Human-readable storage type, e.g. "sqlite+sqlite-vec", "turso+s3".
    pub storage_type: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { hostname_tagging_enabled: true, backend_label: "embedded", storage_type: "sqlite+sqlite-vec".to_string() }
    }
}

/// The unified Memory Service (spec §4.8). Every transport (MCP stdio,
/// HTTP/SSE) is a thin adapter over this type; none of them touch a
/// `StorageBackend` directly.
pub struct MemoryService {
    backend: Arc<dyn StorageBackend>,
    embedder: Arc<dyn Embedder>,
    config: ServiceConfig,
    /// Set when `initialize()` reported a recorded embedding dimension that
    /// disagrees with the configured provider (S6): reads keep working
    /// against the existing data, but writes are refused until the provider
    /// is fixed, since a mismatched vector would corrupt ranking.
    dimension_mismatch: Option<(usize, usize)>,
}

impl MemoryService {
    pub fn new(backend: Arc<dyn StorageBackend>, embedder: Arc<dyn Embedder>, config: ServiceConfig) -> Result<Self> {
        let dimension_mismatch = match backend.initialize() {
            Ok(()) => None,
            Err(EngramError::DimensionMismatch { expected, actual }) => Some((expected, actual)),
            Err(e) => return Err(e),
        };
        Ok(Self { backend, embedder, config, dimension_mismatch })
    }

    /// Resolve the hostname to tag a write with, honoring the precedence in
    /// spec §4.8: explicit argument > request header > process identity.
    fn resolve_hostname(&self, explicit: Option<&str>, header: Option<&str>) -> Option<String> {
        if !self.config.hostname_tagging_enabled {
            return None;
        }
        explicit
            .map(str::to_string)
            .or_else(|| header.map(str::to_string))
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
    }

    pub fn store_memory(
        &self,
        content: String,
        tags: Vec<String>,
        memory_type: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
        client_hostname: Option<&str>,
        header_hostname: Option<&str>,
    ) -> Result<StoreMemoryResponse> {
        if let Some((expected, actual)) = self.dimension_mismatch {
            return Err(EngramError::DimensionMismatch { expected, actual });
        }

        let mut metadata = metadata;
        let mut tags = tags;

        if let Some(hostname) = self.resolve_hostname(client_hostname, header_hostname) {
            metadata.insert(crate::types::META_HOSTNAME.to_string(), serde_json::Value::String(hostname.clone()));
            let source_tag = format!("source:{hostname}");
            if !tags.iter().any(|t| t == &source_tag) {
                tags.push(source_tag);
            }
        }

        let content_hash = identity::content_hash(&content);
        let memory = Memory::new(content, tags, memory_type, metadata)?;
        let (stored, message) = self.backend.store(memory)?;
        Ok(StoreMemoryResponse { success: true, message: if stored { message } else { "duplicate".to_string() }, content_hash })
    }

    pub fn retrieve_memory(&self, query_text: &str, n_results: usize, min_similarity: f32) -> Result<RetrieveMemoryResponse> {
        if query_text.trim().is_empty() {
            return Err(EngramError::InvalidInput("query must not be empty".to_string()));
        }
        let start = Instant::now();
        let results = self.backend.retrieve(query_text, n_results, min_similarity)?;
        Ok(RetrieveMemoryResponse {
            total_found: results.len(),
            results,
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    pub fn search_by_tag(&self, tags: Vec<String>, match_all: bool) -> Result<SearchByTagResponse> {
        if tags.is_empty() {
            return Err(EngramError::InvalidInput("at least one tag is required".to_string()));
        }
        let tags = crate::types::normalize_tags(tags)?;
        let results = self.backend.search_by_tag(&tags, match_all)?;
        Ok(SearchByTagResponse { total_found: results.len(), results, search_tags: tags, match_all })
    }

    pub fn search_by_time(&self, query: TimeQuery, n_results: usize) -> Result<SearchByTimeResponse> {
        let range = match query {
            TimeQuery::Natural(text) => query::parse_time_query(&text)?,
            TimeQuery::Range { start, end } => query::TimeRange { start, end },
        };
        if range.end < range.start {
            return Err(EngramError::InvalidInput("time range end precedes start".to_string()));
        }
        let results = self.backend.search_by_time(range.start, range.end, n_results)?;
        Ok(SearchByTimeResponse { total_found: results.len(), results, start: range.start, end: range.end })
    }

    pub fn search_similar(&self, content_hash: &str, n_results: usize) -> Result<SearchSimilarResponse> {
        let results = self.backend.search_similar_to(content_hash, n_results)?;
        Ok(SearchSimilarResponse { total_found: results.len(), results, source_hash: content_hash.to_string() })
    }

    pub fn delete_memory(&self, content_hash: &str) -> Result<DeleteMemoryResponse> {
        let (success, message) = self.backend.delete(content_hash)?;
        Ok(DeleteMemoryResponse { success, message, content_hash: content_hash.to_string() })
    }

    pub fn delete_by_tag(&self, tag: &str) -> Result<DeleteByTagResponse> {
        let deleted_count = self.backend.delete_by_tag(tag)?;
        Ok(DeleteByTagResponse { success: true, deleted_count })
    }

    pub fn update_memory_metadata(&self, content_hash: &str, patch: MetadataPatch) -> Result<UpdateMetadataResponse> {
        self.backend.update_metadata(content_hash, patch)?;
        Ok(UpdateMetadataResponse { success: true, content_hash: content_hash.to_string() })
    }

    pub fn list_memories(&self, page: usize, page_size: usize, filters: ListFilters) -> Result<ListMemoriesResponse> {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let offset = (page - 1) * page_size;
        let ListPage { items, total } = self.backend.list(offset, page_size, filters)?;
        let has_more = (offset + items.len()) < total as usize;
        Ok(ListMemoriesResponse { results: items, total, page, page_size, has_more })
    }

    pub fn check_database_health(&self) -> Result<HealthReport> {
        let health_status = self.backend.health_check()?;
        let raw_stats = self.backend.get_stats()?;
        let mut stats: EngineStats =
            health::build_stats(self.config.backend_label, self.config.storage_type.clone(), raw_stats, self.embedder.cache_stats());

        if let Some((expected, actual)) = self.dimension_mismatch {
            stats.healthy = false;
            stats.details.insert(
                "DimensionMismatch".to_string(),
                format!("recorded dimension {expected} disagrees with provider dimension {actual}"),
            );
        }

        Ok(health::build_report(health_status, stats))
    }

    pub fn cleanup_duplicates(&self) -> Result<usize> {
        self.backend.cleanup_duplicates()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::LocalEmbedder;
    use crate::storage::SqliteBackend;

    fn service() -> MemoryService {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(32));
        let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory(embedder.clone()).unwrap());
        MemoryService::new(backend, embedder, ServiceConfig::default()).unwrap()
    }

    #[test]
    fn store_then_retrieve_round_trips() {
        let service = service();
        let response = service
            .store_memory("deployed the new auth service".to_string(), vec!["ops".to_string()], None, HashMap::new(), None, None)
            .unwrap();
        assert!(response.success);

        let found = service.retrieve_memory("auth service deployment", 5, 0.0).unwrap();
        assert_eq!(found.results[0].memory.content_hash, response.content_hash);
    }

    #[test]
    fn hostname_tagging_adds_source_tag_and_metadata() {
        let service = service();
        let response = service
            .store_memory("note".to_string(), vec![], None, HashMap::new(), Some("laptop-1"), None)
            .unwrap();
        let fetched = service.search_by_tag(vec!["source:laptop-1".to_string()], false).unwrap();
        assert_eq!(fetched.results.len(), 1);
        assert_eq!(fetched.results[0].content_hash, response.content_hash);
        assert_eq!(
            fetched.results[0].metadata.get("hostname").and_then(|v| v.as_str()),
            Some("laptop-1")
        );
    }

    #[test]
    fn empty_query_is_invalid_input() {
        let service = service();
        let err = service.retrieve_memory("   ", 5, 0.0).unwrap_err();
        assert!(matches!(err, EngramError::InvalidInput(_)));
    }

    #[test]
    fn list_memories_reports_has_more() {
        let service = service();
        for i in 0..3 {
            service
                .store_memory(format!("memory {i}"), vec![], None, HashMap::new(), None, None)
                .unwrap();
        }
        let page1 = service.list_memories(1, 2, ListFilters::default()).unwrap();
        assert_eq!(page1.results.len(), 2);
        assert!(page1.has_more);

        let page2 = service.list_memories(2, 2, ListFilters::default()).unwrap();
        assert_eq!(page2.results.len(), 1);
        assert!(!page2.has_more);
    }

    #[test]
    fn check_database_health_reports_backend_label() {
        let service = service();
        let report = service.check_database_health().unwrap();
        assert!(report.healthy);
        assert_eq!(report.stats.backend, "embedded");
    }
}
