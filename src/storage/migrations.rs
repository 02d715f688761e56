//! Schema for the embedded vector-SQL backend (spec §4.5).
//!
//! `memories` is keyed by `content_hash`; tags are normalized into
//! `memory_tags`; embeddings live in the `memory_vectors` virtual table
//! (sqlite-vec), addressed indirectly through `vector_map` since vtab rowids
//! aren't guaranteed stable across content_hash values. `memory_large` is the
//! optional inline-size overflow table (spec's Open Question: large-object
//! spill is cloud-only in this implementation, so this table stays unused by
//! the embedded backend but is kept for schema parity with the cloud side).

use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i32 = 1;

pub fn run_migrations(conn: &Connection, embedding_dimension: usize) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn, embedding_dimension)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection, embedding_dimension: usize) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            content_hash TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            memory_type TEXT NOT NULL DEFAULT 'note',
            created_at REAL NOT NULL,
            updated_at REAL NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);

        CREATE TABLE IF NOT EXISTS memory_tags (
            content_hash TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (content_hash, tag),
            FOREIGN KEY (content_hash) REFERENCES memories(content_hash) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_memory_tags_content_hash ON memory_tags(content_hash);
        CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag);

        CREATE TABLE IF NOT EXISTS vector_map (
            content_hash TEXT PRIMARY KEY,
            rowid INTEGER NOT NULL UNIQUE,
            FOREIGN KEY (content_hash) REFERENCES memories(content_hash) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS memory_large (
            content_hash TEXT PRIMARY KEY,
            bytes BLOB NOT NULL,
            FOREIGN KEY (content_hash) REFERENCES memories(content_hash) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS engram_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;

    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memory_vectors USING vec0(embedding float[{embedding_dimension}]);"
    ))?;

    conn.execute(
        "INSERT INTO schema_version (version) VALUES (1) ON CONFLICT(version) DO NOTHING",
        [],
    )?;

    Ok(())
}

/// Verify the embedding dimension recorded at schema creation matches the
/// currently configured provider. Returns the previously recorded dimension,
/// if any, so the caller can raise `DimensionMismatch` (spec §4.5, S6).
pub fn recorded_embedding_dimension(conn: &Connection) -> Result<Option<usize>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM engram_config WHERE key = 'embedding_dimension'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(value.and_then(|v| v.parse().ok()))
}

pub fn record_embedding_dimension(conn: &Connection, dimension: usize) -> Result<()> {
    conn.execute(
        "INSERT INTO engram_config (key, value) VALUES ('embedding_dimension', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![dimension.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
        run_migrations(&conn, 384).unwrap();
        run_migrations(&conn, 384).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn records_and_reads_embedding_dimension() {
        let conn = Connection::open_in_memory().unwrap();
        unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        }
        run_migrations(&conn, 384).unwrap();
        assert_eq!(recorded_embedding_dimension(&conn).unwrap(), None);
        record_embedding_dimension(&conn, 384).unwrap();
        assert_eq!(recorded_embedding_dimension(&conn).unwrap(), Some(384));
    }
}
