//! Error types for the memory engine.
//!
//! `EngramError` is the single error enum returned by every layer: storage
//! backends, the embedding provider, the query engine, and both transports.
//! Each variant maps to a stable `kind` string (used on the wire, see
//! [`EngramError::kind`]) and a JSON-RPC numeric code (see
//! [`EngramError::code`]), and to an HTTP status via [`EngramError::http_status`].

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngramError>;

/// The error taxonomy for the memory engine.
///
/// Variants are deliberately few and coarse: callers branch on `kind()`, not
/// on the Rust variant, so the taxonomy stays stable across backend changes.
#[derive(Error, Debug)]
pub enum EngramError {
    /// A request argument failed validation (empty content, bad tag, malformed
    /// time expression, metadata value of a disallowed JSON type, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested memory does not exist (by content_hash or other key).
    #[error("not found: {0}")]
    NotFound(String),

    /// Not an error path for API purposes: returned internally when a store
    /// request exactly matches an existing memory's content_hash. Callers
    /// surface this as a successful response carrying `duplicate: true`.
    #[error("duplicate of existing memory {existing_hash}")]
    Duplicate { existing_hash: String },

    /// The storage backend could not be reached or is temporarily down.
    /// Retryable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An operation exceeded its allotted time budget (see the per-operation
    /// timeout table). Retryable.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A query or stored embedding's dimensionality does not match the
    /// embedding provider currently configured.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// HTTP transport only: missing or invalid bearer credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A concurrency or capacity limit was hit (embedding queue saturated,
    /// too many in-flight requests). Callers should back off.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Anything else: bugs, invariant violations, unexpected backend
    /// responses. Never exposed to clients with internal detail beyond the
    /// `kind` string.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "openai")]
    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngramError {
    /// Stable, machine-readable taxonomy name carried on the wire (spec §7).
    pub fn kind(&self) -> &'static str {
        match self {
            EngramError::InvalidInput(_) => "invalid_input",
            EngramError::NotFound(_) => "not_found",
            EngramError::Duplicate { .. } => "duplicate",
            EngramError::BackendUnavailable(_) => "backend_unavailable",
            EngramError::Timeout(_) => "timeout",
            EngramError::DimensionMismatch { .. } => "dimension_mismatch",
            EngramError::Unauthorized(_) => "unauthorized",
            EngramError::ResourceExhausted(_) => "resource_exhausted",
            EngramError::Internal(_) => "internal",
            EngramError::Database(_) => "backend_unavailable",
            EngramError::Serialization(_) => "invalid_input",
            EngramError::Io(_) => "internal",
            #[cfg(feature = "openai")]
            EngramError::Http(_) => "backend_unavailable",
        }
    }

    /// Whether a caller may reasonably retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngramError::BackendUnavailable(_) | EngramError::Timeout(_)
        )
    }

    /// JSON-RPC numeric error code for the MCP transport.
    pub fn code(&self) -> i64 {
        match self {
            EngramError::InvalidInput(_) => -32602,
            EngramError::NotFound(_) => -32001,
            EngramError::Duplicate { .. } => -32002,
            EngramError::BackendUnavailable(_) => -32003,
            EngramError::Timeout(_) => -32004,
            EngramError::DimensionMismatch { .. } => -32005,
            EngramError::Unauthorized(_) => -32006,
            EngramError::ResourceExhausted(_) => -32007,
            _ => -32000,
        }
    }

    /// HTTP status code for the coordinator surface.
    pub fn http_status(&self) -> u16 {
        match self {
            EngramError::InvalidInput(_) => 400,
            EngramError::NotFound(_) => 404,
            EngramError::Duplicate { .. } => 200,
            EngramError::BackendUnavailable(_) => 503,
            EngramError::Timeout(_) => 504,
            EngramError::DimensionMismatch { .. } => 422,
            EngramError::Unauthorized(_) => 401,
            EngramError::ResourceExhausted(_) => 429,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_per_variant() {
        assert_eq!(EngramError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(EngramError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            EngramError::Duplicate { existing_hash: "h".into() }.kind(),
            "duplicate"
        );
    }

    #[test]
    fn retryable_only_for_transient_kinds() {
        assert!(EngramError::BackendUnavailable("down".into()).is_retryable());
        assert!(EngramError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!EngramError::InvalidInput("bad".into()).is_retryable());
        assert!(!EngramError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(EngramError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngramError::Unauthorized("x".into()).http_status(), 401);
        assert_eq!(EngramError::ResourceExhausted("x".into()).http_status(), 429);
        assert_eq!(EngramError::Internal("x".into()).http_status(), 500);
    }
}
