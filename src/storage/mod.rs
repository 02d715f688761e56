//! Storage engine for Engram: the backend abstraction (spec §4.4) and its
//! three implementations — embedded SQLite+vector (§4.5), cloud
//! vector+relational (§4.6), and HTTP-federated (§4.7).

mod backend;
#[cfg(feature = "cloud")]
mod cloud_backend;
mod connection;
#[cfg(feature = "openai")]
mod http_backend;
mod migrations;
pub mod queries;
mod sqlite_backend;

pub use backend::{HealthStatus, ListPage, StorageBackend, StorageStats};
#[cfg(feature = "cloud")]
pub use cloud_backend::{CloudBackend, CloudConfig, RepairQueueEntry};
pub use connection::{SqliteConfig, Storage, StorageMode};
#[cfg(feature = "openai")]
pub use http_backend::{HttpBackend, HttpBackendConfig};
pub use sqlite_backend::SqliteBackend;
