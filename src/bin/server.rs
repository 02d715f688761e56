//! Engram server: runs the MCP stdio transport and, depending on the
//! coordinator mode selected at startup (spec §4.9), the HTTP/SSE transport
//! too.
//!
//! Run with: engram-server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use engram::coordinator::{select_mode, CoordinatorConfig, Mode};
use engram::embedding::{create_embedder, EmbeddingProviderConfig};
use engram::error::{EngramError, Result};
use engram::http::{build_router, HttpConfig};
use engram::mcp::{EngramMcpHandler, McpServer};
use engram::service::{MemoryService, ServiceConfig};
use engram::storage::StorageBackend;
#[cfg(feature = "cloud")]
use engram::storage::{CloudBackend, CloudConfig};
#[cfg(feature = "openai")]
use engram::storage::{HttpBackend, HttpBackendConfig};
use engram::storage::{SqliteBackend, SqliteConfig, StorageMode};

/// Configuration for `engram-server` (spec §6.4). Every knob is also
/// settable via its `env` variable so the process can be configured purely
/// from the environment (container / service-manager friendly).
#[derive(Parser, Debug)]
#[command(name = "engram-server")]
#[command(about = "Engram memory service: MCP stdio + HTTP/SSE")]
struct Args {
    /// storage_backend: embedded, cloud, or federated.
    #[arg(long, env = "ENGRAM_STORAGE_BACKEND", default_value = "embedded")]
    storage_backend: String,

    /// embedded.path
    #[arg(long, env = "ENGRAM_DB_PATH", default_value = "~/.local/share/engram/memories.db")]
    db_path: String,

    /// embedded.pragmas (comma-separated `key=value` overrides)
    #[arg(long, env = "ENGRAM_PRAGMAS")]
    pragmas: Option<String>,

    /// Use the Dropbox/OneDrive/iCloud-safe journaling mode instead of WAL.
    #[arg(long, env = "ENGRAM_CLOUD_SAFE_JOURNAL")]
    cloud_safe_journal: bool,

    /// cloud.relational_db (libSQL/Turso URL)
    #[arg(long, env = "ENGRAM_CLOUD_RELATIONAL_DB")]
    cloud_relational_db: Option<String>,

    /// cloud.token
    #[arg(long, env = "ENGRAM_CLOUD_TOKEN")]
    cloud_token: Option<String>,

    /// cloud.object_bucket
    #[arg(long, env = "ENGRAM_CLOUD_BUCKET")]
    cloud_bucket: Option<String>,

    /// cloud.large_content_threshold_bytes
    #[arg(long, env = "ENGRAM_CLOUD_LARGE_CONTENT_THRESHOLD", default_value_t = 1_048_576)]
    cloud_large_content_threshold: usize,

    /// cloud.max_retries
    #[arg(long, env = "ENGRAM_CLOUD_MAX_RETRIES", default_value_t = 3)]
    cloud_max_retries: u32,

    /// cloud.base_delay_s
    #[arg(long, env = "ENGRAM_CLOUD_BASE_DELAY_S", default_value_t = 1.0)]
    cloud_base_delay_s: f64,

    /// federated.endpoint
    #[arg(long, env = "ENGRAM_FEDERATED_ENDPOINT", default_value = "http://127.0.0.1:8787")]
    federated_endpoint: String,

    /// federated.api_key
    #[arg(long, env = "ENGRAM_FEDERATED_API_KEY")]
    federated_api_key: Option<String>,

    /// embedding.model: local or openai.
    #[arg(long, env = "ENGRAM_EMBEDDING_MODEL", default_value = "local")]
    embedding_model: String,

    /// embedding.cache_size
    #[arg(long, env = "ENGRAM_EMBEDDING_CACHE_SIZE", default_value_t = 1024)]
    embedding_cache_size: usize,

    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    #[arg(long, env = "OPENAI_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    openai_embedding_model: String,

    #[arg(long, env = "OPENAI_EMBEDDING_DIMENSIONS", default_value_t = 384)]
    embedding_dimensions: usize,

    /// http.enabled
    #[arg(long, env = "ENGRAM_HTTP_ENABLED", default_value_t = true)]
    http_enabled: bool,

    /// http.host
    #[arg(long, env = "ENGRAM_HTTP_HOST", default_value = "0.0.0.0")]
    http_host: String,

    /// http.port
    #[arg(long, env = "ENGRAM_HTTP_PORT", default_value_t = 8787)]
    http_port: u16,

    /// http.cors_origins (comma-separated)
    #[arg(long, env = "ENGRAM_HTTP_CORS_ORIGINS")]
    http_cors_origins: Option<String>,

    /// http.sse_heartbeat_s
    #[arg(long, env = "ENGRAM_HTTP_SSE_HEARTBEAT_S", default_value_t = 30)]
    http_sse_heartbeat_s: u64,

    /// hostname_tagging_enabled
    #[arg(long, env = "ENGRAM_HOSTNAME_TAGGING", default_value_t = true)]
    hostname_tagging: bool,

    /// Log output as JSON instead of human-readable text.
    #[arg(long, env = "ENGRAM_LOG_JSON")]
    log_json: bool,
}

fn init_logging(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_embedder(args: &Args) -> Result<Arc<dyn engram::embedding::Embedder>> {
    let config = EmbeddingProviderConfig {
        model: args.embedding_model.clone(),
        api_key: args.openai_api_key.clone(),
        base_url: args.openai_base_url.clone(),
        openai_model: args.openai_embedding_model.clone(),
        dimensions: args.embedding_dimensions,
        cache_size: args.embedding_cache_size,
    };
    create_embedder(&config)
}

fn build_backend(
    args: &Args,
    mode: Mode,
    embedder: Arc<dyn engram::embedding::Embedder>,
) -> Result<(Arc<dyn StorageBackend>, &'static str, String)> {
    if !mode.owns_storage() {
        #[cfg(feature = "openai")]
        {
            let config = HttpBackendConfig {
                endpoint: args.federated_endpoint.clone(),
                api_key: args.federated_api_key.clone(),
                timeout: Duration::from_secs(10),
            };
            let backend: Arc<dyn StorageBackend> = Arc::new(HttpBackend::new(config)?);
            return Ok((backend, "federated", "http-federated".to_string()));
        }
        #[cfg(not(feature = "openai"))]
        {
            return Err(EngramError::Internal(
                "federated mode requires the `openai` feature (HTTP client)".to_string(),
            ));
        }
    }

    match args.storage_backend.as_str() {
        "cloud" => {
            #[cfg(feature = "cloud")]
            {
                let config = CloudConfig {
                    relational_url: args.cloud_relational_db.clone().unwrap_or_default(),
                    relational_token: args.cloud_token.clone(),
                    object_bucket: args.cloud_bucket.clone(),
                    encryption_key: None,
                    embedding_model: args.embedding_model.clone(),
                    large_content_threshold_bytes: args.cloud_large_content_threshold,
                    max_retries: args.cloud_max_retries,
                    base_delay_s: args.cloud_base_delay_s,
                };
                let backend: Arc<dyn StorageBackend> = Arc::new(CloudBackend::new(config, embedder)?);
                Ok((backend, "cloud", "turso+s3".to_string()))
            }
            #[cfg(not(feature = "cloud"))]
            {
                Err(EngramError::InvalidInput("cloud backend requested but the `cloud` feature is disabled".to_string()))
            }
        }
        "embedded" | "" => {
            let db_path = shellexpand::tilde(&args.db_path).to_string();
            let storage_mode = if args.cloud_safe_journal { StorageMode::CloudSafe } else { StorageMode::Local };
            let extra_pragmas = args
                .pragmas
                .as_deref()
                .map(|p| p.split(',').map(str::trim).map(str::to_string).collect())
                .unwrap_or_default();
            let config = SqliteConfig {
                db_path,
                storage_mode,
                extra_pragmas,
                embedding_dimension: embedder.dimensions(),
            };
            let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(config, embedder)?);
            Ok((backend, "embedded", "sqlite+sqlite-vec".to_string()))
        }
        other => Err(EngramError::InvalidInput(format!("unknown storage_backend: {other}"))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let bind_addr: SocketAddr = format!("{}:{}", args.http_host, args.http_port)
        .parse()
        .map_err(|e| EngramError::InvalidInput(format!("invalid http host/port: {e}")))?;
    let coordinator_config = CoordinatorConfig {
        bind_addr,
        endpoint: args.federated_endpoint.clone(),
        http_enabled: args.http_enabled,
        liveness_timeout: Duration::from_secs(2),
    };
    let mode = select_mode(&coordinator_config);
    tracing::info!(?mode, "coordinator mode selected");

    let embedder = build_embedder(&args)?;
    let (backend, backend_label, storage_type) = build_backend(&args, mode, embedder.clone())?;

    let service_config = ServiceConfig {
        hostname_tagging_enabled: args.hostname_tagging,
        backend_label,
        storage_type,
    };
    let service = Arc::new(MemoryService::new(backend, embedder, service_config)?);

    if mode.runs_http_server() {
        let cors_origins = args
            .http_cors_origins
            .as_deref()
            .map(|s| s.split(',').map(str::trim).map(str::to_string).collect())
            .unwrap_or_default();
        let http_config = HttpConfig {
            cors_origins,
            sse_heartbeat: Duration::from_secs(args.http_sse_heartbeat_s),
            api_key: args.federated_api_key.clone(),
        };
        let router = build_router(service.clone(), http_config);
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| EngramError::BackendUnavailable(format!("binding http server: {e}")))?;
        tracing::info!(%bind_addr, "http coordinator listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "http server exited");
            }
        });
    }

    tracing::info!("starting MCP stdio server");
    let handler = EngramMcpHandler::new(service);
    tokio::task::spawn_blocking(move || McpServer::new(handler).run())
        .await
        .map_err(|e| EngramError::Internal(format!("mcp server task panicked: {e}")))??;

    Ok(())
}
