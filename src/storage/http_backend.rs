//! The HTTP-federated backend (spec §4.7): implements `StorageBackend` by
//! calling a coordinator's HTTP API (§6.2) over `reqwest`, the same client
//! used by the embedding provider's remote mode.
#![cfg(feature = "openai")]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::error::{EngramError, Result};
use crate::types::{ListFilters, Memory, MemoryQueryResult, MetadataPatch};

use super::backend::{HealthStatus, ListPage, StorageBackend, StorageStats};

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL of the coordinator, e.g. `http://127.0.0.1:8787`.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self { endpoint: "http://127.0.0.1:8787".to_string(), api_key: None, timeout: Duration::from_secs(10) }
    }
}

pub struct HttpBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngramError::Internal(format!("building http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.endpoint, path);
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.config.api_key {
            req = req.bearer_auth(token);
        }
        req
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| Handle::current().block_on(fut))
    }

    async fn send_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let mut req = self.request(method, path);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EngramError::Unauthorized("coordinator rejected credentials".to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngramError::BackendUnavailable(format!("coordinator returned {status}: {body}")));
        }

        response.json::<T>().await.map_err(|e| EngramError::BackendUnavailable(format!("decoding response: {e}")))
    }
}

#[derive(Serialize)]
struct StoreRequest<'a> {
    content: &'a str,
    tags: &'a [String],
    memory_type: &'a str,
    metadata: &'a std::collections::HashMap<String, serde_json::Value>,
    content_hash: &'a str,
}

#[derive(Deserialize)]
struct StoreResponse {
    success: bool,
    message: String,
    #[allow(dead_code)]
    content_hash: String,
}

#[derive(Serialize)]
struct RetrieveRequest<'a> {
    query: &'a str,
    n: usize,
    min_similarity: f32,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    results: Vec<MemoryQueryResult>,
}

#[derive(Serialize)]
struct TagSearchRequest<'a> {
    tags: &'a [String],
    match_all: bool,
}

#[derive(Deserialize)]
struct TagSearchResponse {
    results: Vec<Memory>,
}

#[derive(Serialize)]
struct TimeSearchRequest {
    start: f64,
    end: f64,
    n: usize,
}

#[derive(Deserialize)]
struct TimeSearchResponse {
    results: Vec<Memory>,
}

#[derive(Serialize)]
struct SimilarRequest<'a> {
    content_hash: &'a str,
    n: usize,
}

#[derive(Deserialize)]
struct SimilarResponse {
    results: Vec<MemoryQueryResult>,
}

#[derive(Deserialize)]
struct DeleteResponse {
    success: bool,
    message: String,
}

#[derive(Deserialize)]
struct DeleteByTagResponse {
    deleted_count: usize,
}

#[derive(Deserialize)]
struct ListResponse {
    results: Vec<Memory>,
    total: i64,
}

#[derive(Deserialize)]
struct HealthDetailResponse {
    healthy: bool,
    latency_ms: f64,
    error: Option<String>,
    stats: StatsDto,
}

#[derive(Deserialize)]
struct StatsDto {
    total_memories: i64,
    total_tags: i64,
    embedding_model: String,
    embedding_dimension: usize,
    healthy: bool,
    storage_size: String,
}

impl StorageBackend for HttpBackend {
    fn initialize(&self) -> Result<()> {
        // The coordinator owns schema/dimension reconciliation; a federated
        // client only needs to confirm it can reach it.
        self.health_check().map(|_| ())
    }

    fn store(&self, memory: Memory) -> Result<(bool, String)> {
        self.block_on(async {
            let request = StoreRequest {
                content: &memory.content,
                tags: &memory.tags,
                memory_type: &memory.memory_type,
                metadata: &memory.metadata,
                content_hash: &memory.content_hash,
            };
            let response: StoreResponse =
                self.send_json(reqwest::Method::POST, "/api/memories", Some(&request)).await?;
            Ok((response.success, response.message))
        })
    }

    fn retrieve(&self, query_text: &str, n: usize, min_similarity: f32) -> Result<Vec<MemoryQueryResult>> {
        self.block_on(async {
            let request = RetrieveRequest { query: query_text, n, min_similarity };
            let response: RetrieveResponse =
                self.send_json(reqwest::Method::POST, "/api/search", Some(&request)).await?;
            Ok(response.results)
        })
    }

    fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>> {
        self.block_on(async {
            let request = TagSearchRequest { tags, match_all };
            let response: TagSearchResponse =
                self.send_json(reqwest::Method::POST, "/api/search/by-tag", Some(&request)).await?;
            Ok(response.results)
        })
    }

    fn search_by_time(&self, start: f64, end: f64, n: usize) -> Result<Vec<Memory>> {
        self.block_on(async {
            let request = TimeSearchRequest { start, end, n };
            let response: TimeSearchResponse =
                self.send_json(reqwest::Method::POST, "/api/search/by-time", Some(&request)).await?;
            Ok(response.results)
        })
    }

    fn search_similar_to(&self, content_hash: &str, n: usize) -> Result<Vec<MemoryQueryResult>> {
        self.block_on(async {
            let request = SimilarRequest { content_hash, n };
            let response: SimilarResponse =
                self.send_json(reqwest::Method::POST, "/api/search/similar", Some(&request)).await?;
            Ok(response.results)
        })
    }

    fn delete(&self, content_hash: &str) -> Result<(bool, String)> {
        self.block_on(async {
            let response: DeleteResponse = self
                .send_json::<(), _>(reqwest::Method::DELETE, &format!("/api/memories/{content_hash}"), None)
                .await?;
            Ok((response.success, response.message))
        })
    }

    fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        self.block_on(async {
            let response: DeleteByTagResponse = self
                .send_json::<(), _>(reqwest::Method::DELETE, &format!("/api/tags/{tag}"), None)
                .await?;
            Ok(response.deleted_count)
        })
    }

    fn update_metadata(&self, content_hash: &str, patch: MetadataPatch) -> Result<()> {
        self.block_on(async {
            let _: serde_json::Value = self
                .send_json(reqwest::Method::PATCH, &format!("/api/memories/{content_hash}"), Some(&patch))
                .await?;
            Ok(())
        })
    }

    fn cleanup_duplicates(&self) -> Result<usize> {
        self.block_on(async {
            let response: serde_json::Value =
                self.send_json::<(), _>(reqwest::Method::POST, "/api/maintenance/cleanup-duplicates", None).await?;
            Ok(response.get("merged").and_then(|v| v.as_u64()).unwrap_or(0) as usize)
        })
    }

    fn get_stats(&self) -> Result<StorageStats> {
        self.block_on(async {
            let response: HealthDetailResponse =
                self.send_json::<(), _>(reqwest::Method::GET, "/api/health/detailed", None).await?;
            Ok(StorageStats {
                total_memories: response.stats.total_memories,
                total_tags: response.stats.total_tags,
                storage_size_bytes: None,
                embedding_model: response.stats.embedding_model,
                embedding_dimension: response.stats.embedding_dimension,
                healthy: response.stats.healthy,
                details: std::collections::HashMap::from([
                    ("storage_size".to_string(), response.stats.storage_size),
                    ("endpoint".to_string(), self.config.endpoint.clone()),
                ]),
            })
        })
    }

    fn list(&self, offset: usize, limit: usize, filters: ListFilters) -> Result<ListPage> {
        self.block_on(async {
            let page_size = limit.max(1);
            let page = offset / page_size + 1;
            let mut path = format!("/api/memories?page={page}&page_size={page_size}");
            if let Some(tag) = &filters.tag {
                path.push_str(&format!("&tag={}", urlencode(tag)));
            }
            if let Some(memory_type) = &filters.memory_type {
                path.push_str(&format!("&type={}", urlencode(memory_type)));
            }
            let response: ListResponse = self.send_json::<(), _>(reqwest::Method::GET, &path, None).await?;
            Ok(ListPage { items: response.results, total: response.total })
        })
    }

    fn health_check(&self) -> Result<HealthStatus> {
        self.block_on(async {
            let start = std::time::Instant::now();
            let result: Result<HealthDetailResponse> =
                self.send_json::<(), _>(reqwest::Method::GET, "/api/health/detailed", None).await;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            match result {
                Ok(r) => Ok(HealthStatus { healthy: r.healthy, latency_ms, error: r.error, details: Default::default() }),
                Err(e) => Ok(HealthStatus { healthy: false, latency_ms, error: Some(e.to_string()), details: Default::default() }),
            }
        })
    }

    fn backend_name(&self) -> &'static str {
        "federated"
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
