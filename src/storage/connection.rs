//! SQLite connection management for the embedded backend: WAL pragmas, the
//! cloud-sync-folder safety mode, and `sqlite-vec` extension loading
//! (spec §4.5).

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use super::migrations::run_migrations;
use crate::error::Result;

static VEC_EXTENSION_REGISTERED: std::sync::Once = std::sync::Once::new();

/// Register the `sqlite-vec` virtual table module as an auto-extension so
/// every connection opened afterwards (including `:memory:` ones) gets
/// `memory_vectors` support without per-connection extension loading.
fn ensure_vec_extension_registered() {
    VEC_EXTENSION_REGISTERED.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// Journaling strategy for the embedded backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// WAL journal, tuned for local-disk throughput and concurrency.
    Local,
    /// DELETE journal + synchronous=FULL, safe for Dropbox/OneDrive/iCloud
    /// style sync folders where WAL's `-wal`/`-shm` siblings would corrupt.
    CloudSafe,
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub db_path: String,
    pub storage_mode: StorageMode,
    /// Extra `PRAGMA key=value;` statements layered after the defaults
    /// (spec §6.4 `embedded.pragmas`).
    pub extra_pragmas: Vec<String>,
    /// Dimension of the `memory_vectors` virtual table, fixed at schema
    /// creation time (spec §4.5).
    pub embedding_dimension: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            storage_mode: StorageMode::Local,
            extra_pragmas: Vec::new(),
            embedding_dimension: 384,
        }
    }
}

/// Owns the single writer connection for the embedded backend.
pub struct Storage {
    config: SqliteConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;
        run_migrations(&conn, config.embedding_dimension)?;

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(SqliteConfig::default())
    }

    fn create_connection(config: &SqliteConfig) -> Result<Connection> {
        ensure_vec_extension_registered();

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&config.db_path, flags)?
        };

        Self::configure_pragmas(&conn, config)?;
        Ok(conn)
    }

    /// Apply the pragma set for `mode` (spec §4.5), then any operator
    /// overrides from `embedded.pragmas`.
    fn configure_pragmas(conn: &Connection, config: &SqliteConfig) -> Result<()> {
        match config.storage_mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA wal_autocheckpoint=1000;
                    PRAGMA busy_timeout=30000;
                    PRAGMA cache_size=-64000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA mmap_size=268435456;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA cache_size=-32000;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA foreign_keys=ON;
                    "#,
                )?;
            }
        }

        for pragma in &config.extra_pragmas {
            conn.execute_batch(&format!("PRAGMA {pragma};"))?;
        }

        Ok(())
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// Heuristic detection of a cloud-synced folder, used to warn operators
    /// who leave `storage_mode=local` (WAL) pointed at Dropbox/OneDrive/iCloud.
    pub fn is_in_cloud_folder(&self) -> bool {
        let path = self.config.db_path.to_lowercase();
        path.contains("dropbox")
            || path.contains("onedrive")
            || path.contains("icloud")
            || path.contains("google drive")
    }

    pub fn storage_mode_warning(&self) -> Option<String> {
        if self.is_in_cloud_folder() && self.config.storage_mode == StorageMode::Local {
            Some(format!(
                "database '{}' appears to live in a cloud-synced folder; WAL mode's -wal/-shm \
                 siblings may not sync atomically and can corrupt. Set storage_mode=cloud-safe \
                 or move the database to a local-only folder.",
                self.config.db_path
            ))
        } else {
            None
        }
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.config.storage_mode == StorageMode::Local {
            let conn = self.conn.lock();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }

    pub fn db_size_bytes(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let size: i64 = conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;
        Ok(size.max(0) as u64)
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
        assert_eq!(storage.storage_mode(), StorageMode::Local);
    }

    #[test]
    fn cloud_safe_mode_opens_cleanly() {
        let config = SqliteConfig {
            storage_mode: StorageMode::CloudSafe,
            ..Default::default()
        };
        let storage = Storage::open(config).unwrap();
        assert_eq!(storage.storage_mode(), StorageMode::CloudSafe);
    }

    #[test]
    fn detects_cloud_sync_folders_by_path() {
        let config = SqliteConfig {
            db_path: "/Users/test/Dropbox/memories.db".to_string(),
            ..Default::default()
        };
        assert!(config.db_path.to_lowercase().contains("dropbox"));
    }
}
