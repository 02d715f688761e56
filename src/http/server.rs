//! The HTTP coordinator surface: axum routes for store/list/delete/search
//! plus a Server-Sent Events change feed.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use crate::error::EngramError;
use crate::service::{MemoryService, TimeQuery};
use crate::types::{ListFilters, MetadataPatch};

use super::events::ChangeEvent;

#[derive(Clone)]
pub struct HttpConfig {
    pub cors_origins: Vec<String>,
    pub sse_heartbeat: Duration,
    pub api_key: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { cors_origins: Vec::new(), sse_heartbeat: Duration::from_secs(30), api_key: None }
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<MemoryService>,
    events: broadcast::Sender<ChangeEvent>,
    config: Arc<HttpConfig>,
}

/// A thin wrapper so `EngramError` can be returned directly from axum
/// handlers; maps the taxonomy's `kind()`/`http_status()` onto the wire
/// error shape from spec §7.
struct ApiError(EngramError);

impl From<EngramError> for ApiError {
    fn from(e: EngramError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs a `MemoryService` call on the blocking thread pool so a synchronous
/// storage backend never ties up an async worker thread.
async fn run_blocking<F, T>(service: Arc<MemoryService>, f: F) -> ApiResult<T>
where
    F: FnOnce(&MemoryService) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| ApiError(EngramError::Internal(format!("blocking task panicked: {e}"))))?
        .map_err(ApiError::from)
}

pub fn build_router(service: Arc<MemoryService>, config: HttpConfig) -> Router {
    let (tx, _rx) = broadcast::channel(1024);
    let state = AppState { service, events: tx, config: Arc::new(config.clone()) };

    let cors = if config.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = config.cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/detailed", get(health_detailed))
        .route("/api/memories", post(store_memory).get(list_memories))
        .route("/api/memories/:hash", delete(delete_memory).patch(update_metadata))
        .route("/api/tags/:tag", delete(delete_by_tag))
        .route("/api/search", post(search_retrieve))
        .route("/api/search/by-tag", post(search_by_tag))
        .route("/api/search/by-time", post(search_by_time))
        .route("/api/search/similar", post(search_similar))
        .route("/api/maintenance/cleanup-duplicates", post(cleanup_duplicates))
        .route("/api/events", get(events_stream))
        .layer(cors)
        .with_state(state)
}

fn check_auth(config: &HttpConfig, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &config.api_key else { return Ok(()) };
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError(EngramError::Unauthorized("missing or invalid bearer token".to_string()))),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn health_detailed(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let report = run_blocking(state.service.clone(), |s| s.check_database_health()).await?;
    Ok(Json(report).into_response())
}

#[derive(Deserialize)]
struct StoreRequest {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    memory_type: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, serde_json::Value>,
    client_hostname: Option<String>,
}

async fn store_memory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StoreRequest>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let header_hostname = headers.get("x-client-hostname").and_then(|v| v.to_str().ok()).map(str::to_string);
    let response = run_blocking(state.service.clone(), move |s| {
        s.store_memory(
            request.content,
            request.tags,
            request.memory_type,
            request.metadata,
            request.client_hostname.as_deref(),
            header_hostname.as_deref(),
        )
    })
    .await?;
    let _ = state.events.send(ChangeEvent::stored(response.content_hash.clone()));
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_page")]
    page: usize,
    #[serde(default = "default_page_size")]
    page_size: usize,
    tag: Option<String>,
    #[serde(rename = "type")]
    memory_type: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    10
}

async fn list_memories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let filters = ListFilters { tag: query.tag, memory_type: query.memory_type };
    let response = run_blocking(state.service.clone(), move |s| s.list_memories(query.page, query.page_size, filters)).await?;
    Ok(Json(response).into_response())
}

async fn delete_memory(State(state): State<AppState>, headers: HeaderMap, Path(hash): Path<String>) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let response = run_blocking(state.service.clone(), {
        let hash = hash.clone();
        move |s| s.delete_memory(&hash)
    })
    .await?;
    if response.success {
        let _ = state.events.send(ChangeEvent::deleted(hash));
    }
    Ok(Json(response).into_response())
}

async fn delete_by_tag(State(state): State<AppState>, headers: HeaderMap, Path(tag): Path<String>) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let response = run_blocking(state.service.clone(), move |s| s.delete_by_tag(&tag)).await?;
    Ok(Json(response).into_response())
}

async fn update_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hash): Path<String>,
    Json(patch): Json<MetadataPatch>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let response = run_blocking(state.service.clone(), {
        let hash = hash.clone();
        move |s| s.update_memory_metadata(&hash, patch)
    })
    .await?;
    let _ = state.events.send(ChangeEvent::updated(hash));
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct RetrieveRequest {
    query: String,
    #[serde(default = "default_n_results")]
    n: usize,
    #[serde(default)]
    min_similarity: f32,
}

fn default_n_results() -> usize {
    5
}

async fn search_retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RetrieveRequest>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let response =
        run_blocking(state.service.clone(), move |s| s.retrieve_memory(&request.query, request.n, request.min_similarity)).await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct TagSearchRequest {
    tags: Vec<String>,
    #[serde(default)]
    match_all: bool,
}

async fn search_by_tag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TagSearchRequest>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let response = run_blocking(state.service.clone(), move |s| s.search_by_tag(request.tags, request.match_all)).await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct TimeSearchRequest {
    query: Option<String>,
    start: Option<f64>,
    end: Option<f64>,
    #[serde(default = "default_n_results")]
    n: usize,
}

async fn search_by_time(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TimeSearchRequest>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let time_query = match (request.query, request.start, request.end) {
        (Some(q), _, _) => TimeQuery::Natural(q),
        (None, Some(start), Some(end)) => TimeQuery::Range { start, end },
        _ => return Err(ApiError(EngramError::InvalidInput("search_by_time requires `query` or both `start` and `end`".to_string()))),
    };
    let response = run_blocking(state.service.clone(), move |s| s.search_by_time(time_query, request.n)).await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct SimilarRequest {
    content_hash: String,
    #[serde(default = "default_n_results")]
    n: usize,
}

async fn search_similar(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SimilarRequest>,
) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let response = run_blocking(state.service.clone(), move |s| s.search_similar(&request.content_hash, request.n)).await?;
    Ok(Json(response).into_response())
}

async fn cleanup_duplicates(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    check_auth(&state.config, &headers)?;
    let merged = run_blocking(state.service.clone(), |s| s.cleanup_duplicates()).await?;
    Ok(Json(serde_json::json!({ "merged": merged })).into_response())
}

async fn events_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    check_auth(&state.config, &headers)?;
    let receiver = state.events.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => serde_json::to_string(&event).ok().map(|json| Ok(Event::default().data(json))),
            Err(_lagged) => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.sse_heartbeat).text("heartbeat")))
}

