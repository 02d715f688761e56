//! Coordinator & mode selection (spec §4.9): decides, once per process
//! lifetime, whether this process opens the embedded backend directly, also
//! serves the HTTP coordinator surface, or federates to an existing one.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Handle;

/// The mode this process settled on at startup (spec §4.9). Fixed for the
/// lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Opens the embedded backend itself; relies on WAL for concurrency.
    Direct,
    /// Opens the embedded backend AND runs the HTTP coordinator surface;
    /// other local processes federate to it.
    HttpServer,
    /// Uses the HTTP-federated backend pointed at an existing coordinator.
    HttpClient,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Coordinator bind address used when this process becomes the server.
    pub bind_addr: SocketAddr,
    /// Base URL to probe/federate to, e.g. `http://127.0.0.1:8787`.
    pub endpoint: String,
    /// Whether the operator has HTTP enabled at all (`http.enabled`,
    /// spec §6.4); when false, a successful bind still falls back to
    /// `Direct` rather than `HttpServer`.
    pub http_enabled: bool,
    pub liveness_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8787)),
            endpoint: "http://127.0.0.1:8787".to_string(),
            http_enabled: true,
            liveness_timeout: Duration::from_secs(2),
        }
    }
}

/// Runs the selection algorithm from spec §4.9:
/// 1. If the configured endpoint answers a liveness probe: `HttpClient`.
/// 2. Else, try to bind the coordinator port:
///    - success: `HttpServer` if HTTP is enabled, else `Direct`.
///    - failure: `Direct`.
pub fn select_mode(config: &CoordinatorConfig) -> Mode {
    tokio::task::block_in_place(|| Handle::current().block_on(select_mode_async(config)))
}

async fn select_mode_async(config: &CoordinatorConfig) -> Mode {
    if probe_liveness(&config.endpoint, config.liveness_timeout).await {
        return Mode::HttpClient;
    }

    match TcpListener::bind(config.bind_addr).await {
        Ok(listener) => {
            drop(listener);
            if config.http_enabled {
                Mode::HttpServer
            } else {
                Mode::Direct
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, addr = %config.bind_addr, "coordinator port unavailable, falling back to direct mode");
            Mode::Direct
        }
    }
}

async fn probe_liveness(endpoint: &str, timeout: Duration) -> bool {
    #[cfg(feature = "openai")]
    {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(_) => return false,
        };
        client
            .get(format!("{endpoint}/api/health"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
    #[cfg(not(feature = "openai"))]
    {
        let _ = (endpoint, timeout);
        false
    }
}

impl Mode {
    /// Whether this process should also run the HTTP/SSE coordinator
    /// surface (spec §6.2).
    pub fn runs_http_server(self) -> bool {
        matches!(self, Mode::HttpServer)
    }

    /// Whether this process opens the embedded/cloud backend directly
    /// rather than delegating through the HTTP-federated backend.
    pub fn owns_storage(self) -> bool {
        matches!(self, Mode::Direct | Mode::HttpServer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_direct_when_bind_fails_and_no_liveness() {
        // Bind a throwaway listener to occupy a known-busy port, then point
        // the coordinator config at it with http disabled end to end.
        let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = busy.local_addr().unwrap();

        let config = CoordinatorConfig {
            bind_addr: addr,
            endpoint: "http://127.0.0.1:1".to_string(),
            http_enabled: true,
            liveness_timeout: Duration::from_millis(50),
        };

        let mode = select_mode_async(&config).await;
        assert_eq!(mode, Mode::Direct);
    }

    #[tokio::test]
    async fn binds_to_http_server_when_port_is_free_and_http_enabled() {
        let config = CoordinatorConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            endpoint: "http://127.0.0.1:1".to_string(),
            http_enabled: true,
            liveness_timeout: Duration::from_millis(50),
        };
        let mode = select_mode_async(&config).await;
        assert_eq!(mode, Mode::HttpServer);
    }

    #[tokio::test]
    async fn free_port_with_http_disabled_selects_direct() {
        let config = CoordinatorConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            endpoint: "http://127.0.0.1:1".to_string(),
            http_enabled: false,
            liveness_timeout: Duration::from_millis(50),
        };
        let mode = select_mode_async(&config).await;
        assert_eq!(mode, Mode::Direct);
    }

    #[test]
    fn mode_predicates() {
        assert!(Mode::Direct.owns_storage());
        assert!(!Mode::Direct.runs_http_server());
        assert!(Mode::HttpServer.owns_storage());
        assert!(Mode::HttpServer.runs_http_server());
        assert!(!Mode::HttpClient.owns_storage());
    }
}
