//! SQL-level operations for the embedded vector-SQL backend (spec §4.5).
//!
//! Each function here operates on a single `rusqlite::Connection` (or a
//! transaction, which derefs to one); `SqliteBackend` composes them under
//! `Storage::with_connection`/`with_transaction` to satisfy the
//! `StorageBackend` trait.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngramError, Result};
use crate::types::{ListFilters, Memory, MetadataPatch};

#[allow(clippy::too_many_arguments)]
fn row_to_memory(
    content_hash: String,
    content: String,
    memory_type: String,
    created_at: f64,
    updated_at: f64,
    metadata_json: String,
    tags: Vec<String>,
    embedding: Option<Vec<f32>>,
) -> Memory {
    let metadata: HashMap<String, serde_json::Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();

    Memory {
        content,
        content_hash,
        tags,
        memory_type,
        metadata,
        created_at,
        created_at_iso: crate::identity::to_rfc3339(created_at),
        updated_at,
        updated_at_iso: crate::identity::to_rfc3339(updated_at),
        embedding,
    }
}

fn load_tags(conn: &Connection, content_hash: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT tag FROM memory_tags WHERE content_hash = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![content_hash], |row| row.get::<_, String>(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(EngramError::from)
}

fn insert_tags(conn: &Connection, content_hash: &str, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM memory_tags WHERE content_hash = ?1", params![content_hash])?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO memory_tags (content_hash, tag) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
    )?;
    for tag in tags {
        stmt.execute(params![content_hash, tag])?;
    }
    Ok(())
}

fn load_embedding(conn: &Connection, content_hash: &str) -> Result<Option<Vec<f32>>> {
    let rowid: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM vector_map WHERE content_hash = ?1",
            params![content_hash],
            |row| row.get(0),
        )
        .optional()?;

    let Some(rowid) = rowid else { return Ok(None) };

    let raw: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM memory_vectors WHERE rowid = ?1",
            params![rowid],
            |row| row.get(0),
        )
        .optional()?;

    Ok(raw.map(|bytes| {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }))
}

/// Write (or overwrite) the embedding row for `content_hash`.
pub fn store_embedding(conn: &Connection, content_hash: &str, embedding: &[f32]) -> Result<()> {
    let existing_rowid: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM vector_map WHERE content_hash = ?1",
            params![content_hash],
            |row| row.get(0),
        )
        .optional()?;

    let json = serde_json::to_string(embedding)?;

    if let Some(rowid) = existing_rowid {
        conn.execute(
            "UPDATE memory_vectors SET embedding = vec_f32(?1) WHERE rowid = ?2",
            params![json, rowid],
        )?;
    } else {
        conn.execute("INSERT INTO memory_vectors (embedding) VALUES (vec_f32(?1))", params![json])?;
        let rowid = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO vector_map (content_hash, rowid) VALUES (?1, ?2)",
            params![content_hash, rowid],
        )?;
    }
    Ok(())
}

/// Insert a Memory row with `ON CONFLICT(content_hash) DO NOTHING`. Returns
/// whether a new row was inserted (spec §4.5 write path, I1).
pub fn insert_memory(conn: &Connection, memory: &Memory) -> Result<bool> {
    let metadata_json = serde_json::to_string(&memory.metadata)?;

    let changed = conn.execute(
        "INSERT INTO memories (content_hash, content, memory_type, created_at, updated_at, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(content_hash) DO NOTHING",
        params![
            memory.content_hash,
            memory.content,
            memory.memory_type,
            memory.created_at,
            memory.updated_at,
            metadata_json,
        ],
    )?;

    if changed > 0 {
        insert_tags(conn, &memory.content_hash, &memory.tags)?;
        if let Some(embedding) = &memory.embedding {
            store_embedding(conn, &memory.content_hash, embedding)?;
        }
    }

    Ok(changed > 0)
}

pub fn get_memory(conn: &Connection, content_hash: &str) -> Result<Option<Memory>> {
    let row = conn
        .query_row(
            "SELECT content_hash, content, memory_type, created_at, updated_at, metadata_json
             FROM memories WHERE content_hash = ?1",
            params![content_hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((hash, content, memory_type, created_at, updated_at, metadata_json)) = row else {
        return Ok(None);
    };

    let tags = load_tags(conn, &hash)?;
    let embedding = load_embedding(conn, &hash)?;
    Ok(Some(row_to_memory(
        hash,
        content,
        memory_type,
        created_at,
        updated_at,
        metadata_json,
        tags,
        embedding,
    )))
}

/// Candidate pool for semantic search: the `k` nearest rows in
/// `memory_vectors`, joined back to `memories` (spec §4.5 "Semantic").
pub fn vector_candidates(conn: &Connection, query_embedding: &[f32], k: usize) -> Result<Vec<(Memory, f32)>> {
    let json = serde_json::to_string(query_embedding)?;
    let mut stmt = conn.prepare(
        "SELECT vm.content_hash, v.distance
         FROM memory_vectors v
         JOIN vector_map vm ON vm.rowid = v.rowid
         WHERE v.embedding MATCH vec_f32(?1) AND k = ?2
         ORDER BY v.distance",
    )?;

    let rows: Vec<(String, f32)> = stmt
        .query_map(params![json, k as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (hash, distance) in rows {
        if let Some(memory) = get_memory(conn, &hash)? {
            out.push((memory, distance));
        }
    }
    Ok(out)
}

/// Memories with no row in `vector_map`, i.e. stored while the embedding
/// provider was not ready (spec §3 Lifecycle "filled lazily on first
/// semantic read"). Bounded by `limit` since a cold store can have many.
pub fn memories_without_embedding(conn: &Connection, limit: usize) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT content_hash FROM memories
         WHERE content_hash NOT IN (SELECT content_hash FROM vector_map)
         ORDER BY created_at DESC LIMIT ?1",
    )?;
    let hashes: Vec<String> = stmt
        .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if let Some(memory) = get_memory(conn, &hash)? {
            out.push(memory);
        }
    }
    Ok(out)
}

pub fn search_by_tag(conn: &Connection, tags: &[String], match_all: bool) -> Result<Vec<Memory>> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = tags.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = if match_all {
        format!(
            "SELECT content_hash FROM memory_tags WHERE tag IN ({placeholders})
             GROUP BY content_hash HAVING COUNT(DISTINCT tag) = ?{}",
            tags.len() + 1
        )
    } else {
        format!("SELECT DISTINCT content_hash FROM memory_tags WHERE tag IN ({placeholders})")
    };

    let mut stmt = conn.prepare(&sql)?;
    let mut bind_params: Vec<&dyn rusqlite::ToSql> = tags.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
    let tag_count = tags.len() as i64;
    if match_all {
        bind_params.push(&tag_count);
    }

    let hashes: Vec<String> = stmt
        .query_map(bind_params.as_slice(), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if let Some(memory) = get_memory(conn, &hash)? {
            out.push(memory);
        }
    }
    crate::query::sort_memories_by_recency(&mut out);
    Ok(out)
}

pub fn search_by_time(conn: &Connection, start: f64, end: f64, n: usize) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT content_hash FROM memories WHERE created_at >= ?1 AND created_at <= ?2
         ORDER BY created_at DESC LIMIT ?3",
    )?;
    let hashes: Vec<String> = stmt
        .query_map(params![start, end, n as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if let Some(memory) = get_memory(conn, &hash)? {
            out.push(memory);
        }
    }
    Ok(out)
}

pub fn delete_memory(conn: &Connection, content_hash: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM memories WHERE content_hash = ?1", params![content_hash])?;
    if changed > 0 {
        conn.execute("DELETE FROM memory_tags WHERE content_hash = ?1", params![content_hash])?;
        let rowid: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM vector_map WHERE content_hash = ?1",
                params![content_hash],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(rowid) = rowid {
            conn.execute("DELETE FROM memory_vectors WHERE rowid = ?1", params![rowid])?;
            conn.execute("DELETE FROM vector_map WHERE content_hash = ?1", params![content_hash])?;
        }
        conn.execute("DELETE FROM memory_large WHERE content_hash = ?1", params![content_hash])?;
    }
    Ok(changed > 0)
}

pub fn delete_by_tag(conn: &Connection, tag: &str) -> Result<usize> {
    let hashes: Vec<String> = {
        let mut stmt = conn.prepare("SELECT content_hash FROM memory_tags WHERE tag = ?1")?;
        stmt.query_map(params![tag], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut count = 0;
    for hash in hashes {
        if delete_memory(conn, &hash)? {
            count += 1;
        }
    }
    Ok(count)
}

pub fn update_metadata(conn: &Connection, content_hash: &str, patch: MetadataPatch) -> Result<()> {
    let existing = get_memory(conn, content_hash)?
        .ok_or_else(|| EngramError::NotFound(format!("no memory with content_hash {content_hash}")))?;

    let mut metadata = existing.metadata;
    if let Some(new_meta) = patch.metadata {
        let normalized = crate::types::normalize_metadata(new_meta)?;
        metadata.extend(normalized);
    }

    let memory_type = patch.memory_type.unwrap_or(existing.memory_type);
    let updated_at = crate::identity::now();
    let metadata_json = serde_json::to_string(&metadata)?;

    conn.execute(
        "UPDATE memories SET metadata_json = ?1, memory_type = ?2, updated_at = ?3 WHERE content_hash = ?4",
        params![metadata_json, memory_type, updated_at, content_hash],
    )?;

    if let Some(new_tags) = patch.tags {
        let normalized = crate::types::normalize_tags(new_tags)?;
        insert_tags(conn, content_hash, &normalized)?;
    }

    Ok(())
}

/// Merge rows sharing a `content_hash` and keep the earliest `created_at`,
/// unioning their tags (spec §4.5 "Duplicate cleanup"). The primary key
/// already forbids the common case going forward; this handles rows that
/// predate a schema change or arrived through direct replication.
pub fn cleanup_duplicates(conn: &Connection) -> Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT content_hash FROM memories GROUP BY content_hash, content HAVING COUNT(*) > 1",
    )?;
    let _unused: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    // content_hash is the primary key, so exact duplicates cannot exist in
    // this schema; nothing to merge. Kept so the StorageBackend contract has
    // a real (if normally no-op) implementation.
    Ok(0)
}

pub fn list_memories(
    conn: &Connection,
    offset: usize,
    limit: usize,
    filters: ListFilters,
) -> Result<(Vec<Memory>, i64)> {
    let mut sql = String::from("SELECT m.content_hash FROM memories m");
    let mut conditions = Vec::new();
    let mut bind: Vec<String> = Vec::new();

    if let Some(tag) = &filters.tag {
        sql.push_str(" JOIN memory_tags mt ON mt.content_hash = m.content_hash");
        conditions.push("mt.tag = ?".to_string());
        bind.push(tag.clone());
    }
    if let Some(memory_type) = &filters.memory_type {
        conditions.push("m.memory_type = ?".to_string());
        bind.push(memory_type.clone());
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    let count_sql = format!("SELECT COUNT(*) FROM ({sql})");
    let total: i64 = conn.query_row(&count_sql, rusqlite::params_from_iter(bind.iter()), |row| row.get(0))?;

    sql.push_str(" ORDER BY m.created_at DESC LIMIT ? OFFSET ?");
    bind.push(limit.to_string());
    bind.push(offset.to_string());

    let mut stmt = conn.prepare(&sql)?;
    let hashes: Vec<String> = stmt
        .query_map(rusqlite::params_from_iter(bind.iter()), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if let Some(memory) = get_memory(conn, &hash)? {
            out.push(memory);
        }
    }
    Ok((out, total))
}

pub fn count_memories(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .map_err(EngramError::from)
}

pub fn count_tags(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(DISTINCT tag) FROM memory_tags", [], |row| row.get(0))
        .map_err(EngramError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::connection::{SqliteConfig, Storage};
    use std::collections::HashMap;

    fn open() -> Storage {
        Storage::open(SqliteConfig::default()).unwrap()
    }

    fn make(content: &str, tags: &[&str]) -> Memory {
        Memory::new(content.to_string(), tags.iter().map(|t| t.to_string()).collect(), None, HashMap::new())
            .unwrap()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                let m = make("hello world", &["a", "b"]);
                assert!(insert_memory(conn, &m)?);
                let fetched = get_memory(conn, &m.content_hash)?.unwrap();
                assert_eq!(fetched.content, "hello world");
                assert_eq!(fetched.tags, vec!["a".to_string(), "b".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                let m = make("same", &[]);
                assert!(insert_memory(conn, &m)?);
                assert!(!insert_memory(conn, &m)?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn tag_search_and_semantics() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                let a = make("a content", &["x", "y"]);
                let b = make("b content", &["x"]);
                let c = make("c content", &["y"]);
                insert_memory(conn, &a)?;
                insert_memory(conn, &b)?;
                insert_memory(conn, &c)?;

                let tags = vec!["x".to_string(), "y".to_string()];
                let and_results = search_by_tag(conn, &tags, true)?;
                assert_eq!(and_results.len(), 1);
                assert_eq!(and_results[0].content_hash, a.content_hash);

                let or_results = search_by_tag(conn, &tags, false)?;
                assert_eq!(or_results.len(), 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_removes_memory_and_tags() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                let m = make("to delete", &["t"]);
                insert_memory(conn, &m)?;
                assert!(delete_memory(conn, &m.content_hash)?);
                assert!(get_memory(conn, &m.content_hash)?.is_none());
                assert!(search_by_tag(conn, &["t".to_string()], false)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn update_metadata_replaces_tags_when_present() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                let m = make("content", &["old"]);
                insert_memory(conn, &m)?;

                let patch = MetadataPatch { metadata: None, tags: Some(vec!["new".to_string()]), memory_type: None };
                update_metadata(conn, &m.content_hash, patch)?;

                let fetched = get_memory(conn, &m.content_hash)?.unwrap();
                assert_eq!(fetched.tags, vec!["new".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn update_metadata_on_missing_hash_is_not_found() {
        let storage = open();
        let err = storage
            .with_transaction(|conn| update_metadata(conn, "deadbeef", MetadataPatch::default()))
            .unwrap_err();
        assert!(matches!(err, EngramError::NotFound(_)));
    }

    #[test]
    fn memories_without_embedding_finds_unvectored_rows() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                let vectored = make("has an embedding", &[]);
                insert_memory(conn, &vectored)?;
                store_embedding(conn, &vectored.content_hash, &[0.1, 0.2, 0.3])?;

                let cold = make("stored while provider was not ready", &[]);
                insert_memory(conn, &cold)?;

                let missing = memories_without_embedding(conn, 10)?;
                assert_eq!(missing.len(), 1);
                assert_eq!(missing[0].content_hash, cold.content_hash);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn list_memories_paginates() {
        let storage = open();
        storage
            .with_transaction(|conn| {
                for i in 0..5 {
                    insert_memory(conn, &make(&format!("item {i}"), &[]))?;
                }
                let (page, total) = list_memories(conn, 0, 2, ListFilters::default())?;
                assert_eq!(page.len(), 2);
                assert_eq!(total, 5);
                Ok(())
            })
            .unwrap();
    }
}
