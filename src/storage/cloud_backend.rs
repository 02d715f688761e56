//! The cloud vector+relational backend (spec §4.6): a remote relational
//! store for `memories`/`memory_tags` metadata, a vector table ranked
//! client-side, and an optional S3-compatible object store for large-content
//! spill, with cloud-safe retry around every remote call.
#![cfg(feature = "cloud")]

use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use libsql::{Builder, Connection as LibsqlConnection, Database};
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{EngramError, Result};
use crate::query;
use crate::types::{ListFilters, Memory, MemoryQueryResult, MetadataPatch};

use super::backend::{HealthStatus, ListPage, StorageBackend, StorageStats};

/// One record of a partial write: the relational row (and tags) landed but a
/// later step failed, leaving the memory readable by hash/tag/time but not
/// by semantic search until repaired.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RepairQueueEntry {
    pub content_hash: String,
    pub stage: String,
    pub error: String,
    pub recorded_at: f64,
}

const MIN_POOL: usize = 50;
/// Bound on how many rows we pull back to rank client-side against a query
/// vector; the relational store has no native ANN index in this
/// implementation (see DESIGN.md).
const VECTOR_SCAN_LIMIT: i64 = 5000;

#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// libSQL/Turso database URL, e.g. `libsql://your-db.turso.io`.
    pub relational_url: String,
    pub relational_token: Option<String>,
    /// S3-compatible bucket for large-content spill, e.g. `my-bucket`.
    /// `None` disables the large-object store; oversized content is then
    /// stored inline regardless of `large_content_threshold_bytes`.
    pub object_bucket: Option<String>,
    /// 32-byte AES-256-GCM key for at-rest encryption of spilled objects.
    /// `None` disables encryption even if `object_bucket` is set.
    pub encryption_key: Option<Vec<u8>>,
    pub embedding_model: String,
    pub large_content_threshold_bytes: usize,
    pub max_retries: u32,
    pub base_delay_s: f64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            relational_url: String::new(),
            relational_token: None,
            object_bucket: None,
            encryption_key: None,
            embedding_model: "local".to_string(),
            large_content_threshold_bytes: 1_048_576,
            max_retries: 3,
            base_delay_s: 1.0,
        }
    }
}

pub struct CloudBackend {
    conn: Arc<AsyncMutex<LibsqlConnection>>,
    s3: Option<S3Client>,
    config: CloudConfig,
    embedder: Arc<dyn Embedder>,
}

impl CloudBackend {
    pub fn new(config: CloudConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        block_on(async {
            let db: Database = if config.relational_url.starts_with("libsql://")
                || config.relational_url.starts_with("https://")
            {
                Builder::new_remote(config.relational_url.clone(), config.relational_token.clone().unwrap_or_default())
                    .build()
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(format!("connecting to relational store: {e}")))?
            } else {
                Builder::new_local(&config.relational_url)
                    .build()
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(format!("opening local replica: {e}")))?
            };

            let conn = db
                .connect()
                .map_err(|e| EngramError::BackendUnavailable(format!("opening connection: {e}")))?;

            let s3 = if config.object_bucket.is_some() {
                let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
                Some(S3Client::new(&aws_config))
            } else {
                None
            };

            Ok(Self { conn: Arc::new(AsyncMutex::new(conn)), s3, config, embedder })
        })
    }

    async fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memories (
                content_hash TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                large_content_ref TEXT,
                memory_type TEXT NOT NULL DEFAULT 'note',
                created_at REAL NOT NULL,
                updated_at REAL NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
            CREATE TABLE IF NOT EXISTS memory_tags (
                content_hash TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (content_hash, tag)
            );
            CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag);
            CREATE TABLE IF NOT EXISTS memory_vectors (
                content_hash TEXT PRIMARY KEY,
                embedding_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS engram_config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS repair_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL,
                stage TEXT NOT NULL,
                error TEXT NOT NULL,
                recorded_at REAL NOT NULL
            );",
        )
        .await
        .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Appends a partial-write failure to the repair queue. Best-effort: if
    /// the queue insert itself fails, the original error still propagates to
    /// the caller, it just won't be listed at startup.
    async fn record_repair(&self, content_hash: &str, stage: &str, error: &str) {
        let conn = self.conn.lock().await;
        let _ = conn
            .execute(
                "INSERT INTO repair_queue (content_hash, stage, error, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                libsql::params![content_hash.to_string(), stage.to_string(), error.to_string(), crate::identity::now()],
            )
            .await;
    }

    /// Entries left by partial writes, oldest first. Read once at startup so
    /// an operator can see what needs reconciling (spec §5: "readable at
    /// startup").
    async fn pending_repairs(&self) -> Result<Vec<RepairQueueEntry>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT content_hash, stage, error, recorded_at FROM repair_queue ORDER BY recorded_at ASC", ())
            .await
            .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
            out.push(RepairQueueEntry {
                content_hash: row.get(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?,
                stage: row.get(1).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?,
                error: row.get(2).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?,
                recorded_at: row.get(3).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?,
            });
        }
        Ok(out)
    }

    async fn recorded_dimension(&self) -> Result<Option<usize>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT value FROM engram_config WHERE key = 'embedding_dimension'", ())
            .await
            .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        match rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
            Some(row) => {
                let value: String = row.get(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                Ok(value.parse().ok())
            }
            None => Ok(None),
        }
    }

    async fn record_dimension(&self, dimension: usize) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO engram_config (key, value) VALUES ('embedding_dimension', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            libsql::params![dimension.to_string()],
        )
        .await
        .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Exponential backoff with jitter around a fallible async operation
    /// (spec §4.6 "retries use exponential backoff ... capped retries ...
    /// with jitter").
    async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let base = self.config.base_delay_s * 2f64.powi(attempt as i32);
                    let jitter: f64 = rand::thread_rng().gen_range(0.0..base * 0.25);
                    tokio::time::sleep(Duration::from_secs_f64(base + jitter)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_large_content(&self, content_hash: &str, content: &str) -> Result<()> {
        let bucket = self.config.object_bucket.as_ref().expect("checked by caller");
        let s3 = self.s3.as_ref().expect("checked by caller");
        let bytes = match &self.config.encryption_key {
            Some(key) => encrypt_bytes(content.as_bytes(), key)?,
            None => content.as_bytes().to_vec(),
        };
        // ByteStream isn't Clone, so the retry closure rebuilds it from the
        // owned bytes on every attempt instead of reusing one instance.
        self.with_retry(|| async {
            s3.put_object()
                .bucket(bucket)
                .key(content_hash)
                .body(ByteStream::from(bytes.clone()))
                .send()
                .await
                .map_err(|e| EngramError::BackendUnavailable(format!("uploading large content: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn download_large_content(&self, content_hash: &str) -> Result<String> {
        let bucket = self.config.object_bucket.as_ref().ok_or_else(|| {
            EngramError::Internal("large_content_ref set but no object bucket configured".to_string())
        })?;
        let s3 = self.s3.as_ref().expect("checked above");
        let response = self
            .with_retry(|| async {
                s3.get_object()
                    .bucket(bucket)
                    .key(content_hash)
                    .send()
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(format!("downloading large content: {e}")))
            })
            .await?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
            .into_bytes();
        let bytes = match &self.config.encryption_key {
            Some(key) => decrypt_bytes(&bytes, key)?,
            None => bytes.to_vec(),
        };
        String::from_utf8(bytes).map_err(|e| EngramError::Internal(format!("large content not valid utf-8: {e}")))
    }

    async fn hydrate_large_content(&self, mut memory: Memory, large_ref: Option<String>) -> Result<Memory> {
        if let Some(hash) = large_ref {
            memory.content = self.download_large_content(&hash).await?;
        }
        Ok(memory)
    }

    async fn row_to_memory(&self, row: &libsql::Row) -> Result<(Memory, Option<String>)> {
        let content_hash: String = row.get(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let content: String = row.get(1).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let large_content_ref: Option<String> = row.get(2).ok();
        let memory_type: String = row.get(3).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let created_at: f64 = row.get(4).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let updated_at: f64 = row.get(5).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let metadata_json: String = row.get(6).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();

        let conn = self.conn.lock().await;
        let mut tag_rows = conn
            .query("SELECT tag FROM memory_tags WHERE content_hash = ?1 ORDER BY tag", libsql::params![content_hash.clone()])
            .await
            .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let mut tags = Vec::new();
        while let Some(row) = tag_rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
            tags.push(row.get::<String>(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?);
        }
        drop(conn);

        Ok((
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
                embedding: None,
            },
            large_content_ref,
        ))
    }
}

impl StorageBackend for CloudBackend {
    fn initialize(&self) -> Result<()> {
        block_on(async {
            self.create_schema().await?;

            let pending = self.pending_repairs().await?;
            if !pending.is_empty() {
                tracing::warn!(count = pending.len(), "repair queue has unresolved partial writes from a previous run");
            }

            match self.recorded_dimension().await? {
                Some(dim) if dim != self.embedder.dimensions() => {
                    Err(EngramError::DimensionMismatch { expected: dim, actual: self.embedder.dimensions() })
                }
                Some(_) => Ok(()),
                None => self.record_dimension(self.embedder.dimensions()).await,
            }
        })
    }

    fn store(&self, memory: Memory) -> Result<(bool, String)> {
        block_on(async {
            let mut memory = memory;
            if memory.embedding.is_none() && self.embedder.ready() {
                memory.embedding = Some(self.embedder.embed(&memory.content)?);
            }

            let oversized = memory.content.len() > self.config.large_content_threshold_bytes;
            let large_ref = if oversized && self.config.object_bucket.is_some() {
                self.upload_large_content(&memory.content_hash, &memory.content).await?;
                Some(memory.content_hash.clone())
            } else {
                None
            };
            let stored_content = if large_ref.is_some() { String::new() } else { memory.content.clone() };

            let conn = self.conn.lock().await;
            let inserted = conn
                .execute(
                    "INSERT INTO memories (content_hash, content, large_content_ref, memory_type, created_at, updated_at, metadata_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(content_hash) DO NOTHING",
                    libsql::params![
                        memory.content_hash.clone(),
                        stored_content,
                        large_ref.clone(),
                        memory.memory_type.clone(),
                        memory.created_at,
                        memory.updated_at,
                        serde_json::to_string(&memory.metadata)?,
                    ],
                )
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;

            if inserted == 0 {
                return Ok((false, "duplicate".to_string()));
            }

            for tag in &memory.tags {
                conn.execute(
                    "INSERT OR IGNORE INTO memory_tags (content_hash, tag) VALUES (?1, ?2)",
                    libsql::params![memory.content_hash.clone(), tag.clone()],
                )
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            }
            drop(conn);

            // Write order: large-object, relational row, then vector upsert
            // last. A failure here leaves the record readable by
            // tag/time/hash but absent from semantic search, and the
            // partial write is recorded in the repair queue rather than
            // silently dropped.
            if let Some(embedding) = &memory.embedding {
                let conn = self.conn.lock().await;
                let upsert = conn
                    .execute(
                        "INSERT INTO memory_vectors (content_hash, embedding_json) VALUES (?1, ?2)
                         ON CONFLICT(content_hash) DO UPDATE SET embedding_json = excluded.embedding_json",
                        libsql::params![memory.content_hash.clone(), serde_json::to_string(embedding)?],
                    )
                    .await;
                drop(conn);
                if let Err(e) = upsert {
                    let message = format!("vector upsert failed, record stays readable by tag/time/hash: {e}");
                    self.record_repair(&memory.content_hash, "vector_upsert", &message).await;
                    return Err(EngramError::BackendUnavailable(message));
                }
            }

            Ok((true, "stored".to_string()))
        })
    }

    fn retrieve(&self, query_text: &str, n: usize, min_similarity: f32) -> Result<Vec<MemoryQueryResult>> {
        if !self.embedder.ready() {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query_text)?;

        block_on(async {
            let conn = self.conn.lock().await;
            let mut rows = conn
                .query(
                    "SELECT v.content_hash, v.embedding_json FROM memory_vectors v
                     JOIN memories m ON m.content_hash = v.content_hash
                     ORDER BY m.created_at DESC LIMIT ?1",
                    libsql::params![VECTOR_SCAN_LIMIT],
                )
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;

            let mut candidates = Vec::new();
            while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
                let hash: String = row.get(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                let embedding_json: String = row.get(1).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                let embedding: Vec<f32> = serde_json::from_str(&embedding_json)?;
                candidates.push((hash, embedding));
            }
            drop(rows);
            drop(conn);

            let pool_size = n.max(MIN_POOL);
            candidates.sort_by(|a, b| {
                cosine_similarity(&query_embedding, &b.1).partial_cmp(&cosine_similarity(&query_embedding, &a.1)).unwrap()
            });
            candidates.truncate(pool_size);

            let mut results = Vec::with_capacity(candidates.len());
            for (hash, embedding) in candidates {
                let row = self.fetch_memory_row(&hash).await?;
                if let Some((memory, large_ref)) = row {
                    let memory = self.hydrate_large_content(memory, large_ref).await?;
                    let cosine = cosine_similarity(&query_embedding, &embedding);
                    let score = query::rescale_similarity(cosine);
                    results.push(MemoryQueryResult::new(memory, score, format!("vector:{score:.4}")));
                }
            }

            query::sort_query_results(&mut results);
            let results = query::apply_min_similarity(results, min_similarity);
            Ok(results.into_iter().take(n).collect())
        })
    }

    fn search_by_tag(&self, tags: &[String], match_all: bool) -> Result<Vec<Memory>> {
        block_on(async {
            if tags.is_empty() {
                return Ok(Vec::new());
            }
            let conn = self.conn.lock().await;
            let placeholders: Vec<String> = (1..=tags.len()).map(|i| format!("?{i}")).collect();
            let sql = if match_all {
                format!(
                    "SELECT content_hash FROM memory_tags WHERE tag IN ({}) GROUP BY content_hash HAVING COUNT(DISTINCT tag) = {}",
                    placeholders.join(", "),
                    tags.len()
                )
            } else {
                format!("SELECT DISTINCT content_hash FROM memory_tags WHERE tag IN ({})", placeholders.join(", "))
            };
            let params: Vec<libsql::Value> = tags.iter().map(|t| libsql::Value::Text(t.clone())).collect();
            let mut rows = conn.query(&sql, params).await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            let mut hashes = Vec::new();
            while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
                hashes.push(row.get::<String>(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?);
            }
            drop(rows);
            drop(conn);

            let mut out = Vec::with_capacity(hashes.len());
            for hash in hashes {
                if let Some((memory, large_ref)) = self.fetch_memory_row(&hash).await? {
                    out.push(self.hydrate_large_content(memory, large_ref).await?);
                }
            }
            out.sort_by(|a, b| b.created_at.partial_cmp(&a.created_at).unwrap());
            Ok(out)
        })
    }

    fn search_by_time(&self, start: f64, end: f64, n: usize) -> Result<Vec<Memory>> {
        block_on(async {
            let conn = self.conn.lock().await;
            let mut rows = conn
                .query(
                    "SELECT content_hash FROM memories WHERE created_at >= ?1 AND created_at <= ?2 ORDER BY created_at DESC LIMIT ?3",
                    libsql::params![start, end, n as i64],
                )
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            let mut hashes = Vec::new();
            while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
                hashes.push(row.get::<String>(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?);
            }
            drop(rows);
            drop(conn);

            let mut out = Vec::with_capacity(hashes.len());
            for hash in hashes {
                if let Some((memory, large_ref)) = self.fetch_memory_row(&hash).await? {
                    out.push(self.hydrate_large_content(memory, large_ref).await?);
                }
            }
            Ok(out)
        })
    }

    fn search_similar_to(&self, content_hash: &str, n: usize) -> Result<Vec<MemoryQueryResult>> {
        block_on(async {
            let (source, _) = self
                .fetch_memory_row(content_hash)
                .await?
                .ok_or_else(|| EngramError::NotFound(format!("no memory with content_hash {content_hash}")))?;

            let embedding = match &source.embedding {
                Some(e) => e.clone(),
                None => {
                    if !self.embedder.ready() {
                        return Err(EngramError::Internal("embedding provider unavailable for similar-to search".to_string()));
                    }
                    self.embedder.embed(&source.content)?
                }
            };

            let conn = self.conn.lock().await;
            let mut rows = conn
                .query(
                    "SELECT v.content_hash, v.embedding_json FROM memory_vectors v
                     JOIN memories m ON m.content_hash = v.content_hash
                     WHERE v.content_hash != ?1
                     ORDER BY m.created_at DESC LIMIT ?2",
                    libsql::params![content_hash.to_string(), VECTOR_SCAN_LIMIT],
                )
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            let mut candidates = Vec::new();
            while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
                let hash: String = row.get(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                let embedding_json: String = row.get(1).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                let candidate_embedding: Vec<f32> = serde_json::from_str(&embedding_json)?;
                candidates.push((hash, candidate_embedding));
            }
            drop(rows);
            drop(conn);

            let mut results = Vec::with_capacity(candidates.len());
            for (hash, candidate_embedding) in candidates {
                if let Some((memory, large_ref)) = self.fetch_memory_row(&hash).await? {
                    let memory = self.hydrate_large_content(memory, large_ref).await?;
                    let cosine = cosine_similarity(&embedding, &candidate_embedding);
                    let score = query::rescale_similarity(cosine);
                    results.push(MemoryQueryResult::new(memory, score, format!("vector:{score:.4}")));
                }
            }
            query::sort_query_results(&mut results);
            Ok(results.into_iter().take(n).collect())
        })
    }

    fn delete(&self, content_hash: &str) -> Result<(bool, String)> {
        block_on(async {
            let conn = self.conn.lock().await;
            let affected = conn
                .execute("DELETE FROM memories WHERE content_hash = ?1", libsql::params![content_hash.to_string()])
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            conn.execute("DELETE FROM memory_tags WHERE content_hash = ?1", libsql::params![content_hash.to_string()])
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            conn.execute("DELETE FROM memory_vectors WHERE content_hash = ?1", libsql::params![content_hash.to_string()])
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            if affected > 0 {
                Ok((true, "deleted".to_string()))
            } else {
                Ok((false, "not found".to_string()))
            }
        })
    }

    fn delete_by_tag(&self, tag: &str) -> Result<usize> {
        block_on(async {
            let conn = self.conn.lock().await;
            let mut rows = conn
                .query("SELECT content_hash FROM memory_tags WHERE tag = ?1", libsql::params![tag.to_string()])
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            let mut hashes = Vec::new();
            while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
                hashes.push(row.get::<String>(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?);
            }
            drop(rows);
            for hash in &hashes {
                conn.execute("DELETE FROM memories WHERE content_hash = ?1", libsql::params![hash.clone()])
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                conn.execute("DELETE FROM memory_tags WHERE content_hash = ?1", libsql::params![hash.clone()])
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                conn.execute("DELETE FROM memory_vectors WHERE content_hash = ?1", libsql::params![hash.clone()])
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            }
            Ok(hashes.len())
        })
    }

    fn update_metadata(&self, content_hash: &str, patch: MetadataPatch) -> Result<()> {
        block_on(async {
            let (memory, _) = self
                .fetch_memory_row(content_hash)
                .await?
                .ok_or_else(|| EngramError::NotFound(format!("no memory with content_hash {content_hash}")))?;

            let mut metadata = memory.metadata;
            if let Some(patch_metadata) = patch.metadata {
                metadata.extend(crate::types::normalize_metadata(patch_metadata)?);
            }
            let memory_type = patch.memory_type.unwrap_or(memory.memory_type);
            let now = crate::identity::now();

            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE memories SET metadata_json = ?1, memory_type = ?2, updated_at = ?3 WHERE content_hash = ?4",
                libsql::params![serde_json::to_string(&metadata)?, memory_type, now, content_hash.to_string()],
            )
            .await
            .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;

            if let Some(tags) = patch.tags {
                let normalized = crate::types::normalize_tags(tags)?;
                conn.execute("DELETE FROM memory_tags WHERE content_hash = ?1", libsql::params![content_hash.to_string()])
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                for tag in normalized {
                    conn.execute(
                        "INSERT OR IGNORE INTO memory_tags (content_hash, tag) VALUES (?1, ?2)",
                        libsql::params![content_hash.to_string(), tag],
                    )
                    .await
                    .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
                }
            }
            Ok(())
        })
    }

    fn cleanup_duplicates(&self) -> Result<usize> {
        // content_hash is the primary key of `memories`; duplicate content
        // can never exist under a different hash (identity is content-only),
        // so there is nothing to merge.
        Ok(0)
    }

    fn get_stats(&self) -> Result<StorageStats> {
        block_on(async {
            let conn = self.conn.lock().await;
            let total_memories: i64 = conn
                .query("SELECT COUNT(*) FROM memories", ())
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
                .next()
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
                .map(|r| r.get(0).unwrap_or(0))
                .unwrap_or(0);
            let total_tags: i64 = conn
                .query("SELECT COUNT(DISTINCT tag) FROM memory_tags", ())
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
                .next()
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
                .map(|r| r.get(0).unwrap_or(0))
                .unwrap_or(0);
            let pending_repairs = self.pending_repairs().await?.len();

            Ok(StorageStats {
                total_memories,
                total_tags,
                storage_size_bytes: None,
                embedding_model: self.embedder.model_name().to_string(),
                embedding_dimension: self.embedder.dimensions(),
                healthy: true,
                details: std::collections::HashMap::from([
                    ("relational_url".to_string(), self.config.relational_url.clone()),
                    ("repair_queue_pending".to_string(), pending_repairs.to_string()),
                ]),
            })
        })
    }

    fn list(&self, offset: usize, limit: usize, filters: ListFilters) -> Result<ListPage> {
        block_on(async {
            let conn = self.conn.lock().await;
            let mut sql = String::from("SELECT m.content_hash FROM memories m");
            let mut conditions = Vec::new();
            let mut bind: Vec<libsql::Value> = Vec::new();
            if let Some(tag) = &filters.tag {
                sql.push_str(" JOIN memory_tags mt ON mt.content_hash = m.content_hash");
                conditions.push("mt.tag = ?".to_string());
                bind.push(libsql::Value::Text(tag.clone()));
            }
            if let Some(memory_type) = &filters.memory_type {
                conditions.push("m.memory_type = ?".to_string());
                bind.push(libsql::Value::Text(memory_type.clone()));
            }
            if !conditions.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
            }

            let count_sql = format!("SELECT COUNT(*) FROM ({sql})");
            let total: i64 = conn
                .query(&count_sql, bind.clone())
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
                .next()
                .await
                .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?
                .map(|r| r.get(0).unwrap_or(0))
                .unwrap_or(0);

            sql.push_str(" ORDER BY m.created_at DESC LIMIT ? OFFSET ?");
            bind.push(libsql::Value::Integer(limit as i64));
            bind.push(libsql::Value::Integer(offset as i64));

            let mut rows = conn.query(&sql, bind).await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            let mut hashes = Vec::new();
            while let Some(row) = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))? {
                hashes.push(row.get::<String>(0).map_err(|e| EngramError::BackendUnavailable(e.to_string()))?);
            }
            drop(rows);
            drop(conn);

            let mut items = Vec::with_capacity(hashes.len());
            for hash in hashes {
                if let Some((memory, large_ref)) = self.fetch_memory_row(&hash).await? {
                    items.push(self.hydrate_large_content(memory, large_ref).await?);
                }
            }
            Ok(ListPage { items, total })
        })
    }

    fn health_check(&self) -> Result<HealthStatus> {
        let start = std::time::Instant::now();
        let result = block_on(async {
            let conn = self.conn.lock().await;
            conn.query("SELECT 1", ()).await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
            Ok(())
        });
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(()) => Ok(HealthStatus { healthy: true, latency_ms, error: None, details: Default::default() }),
            Err(e) => Ok(HealthStatus { healthy: false, latency_ms, error: Some(e.to_string()), details: Default::default() }),
        }
    }

    fn backend_name(&self) -> &'static str {
        "cloud"
    }
}

impl CloudBackend {
    /// Snapshot of the repair queue, oldest entry first.
    pub fn repair_queue(&self) -> Result<Vec<RepairQueueEntry>> {
        block_on(self.pending_repairs())
    }

    async fn fetch_memory_row(&self, content_hash: &str) -> Result<Option<(Memory, Option<String>)>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT content_hash, content, large_content_ref, memory_type, created_at, updated_at, metadata_json
                 FROM memories WHERE content_hash = ?1",
                libsql::params![content_hash.to_string()],
            )
            .await
            .map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        let row = rows.next().await.map_err(|e| EngramError::BackendUnavailable(e.to_string()))?;
        drop(conn);
        match row {
            Some(row) => Ok(Some(self.row_to_memory(&row).await?)),
            None => Ok(None),
        }
    }
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::task::block_in_place(|| Handle::current().block_on(fut))
}

/// AES-256-GCM encrypt, prefixing the ciphertext with a fresh random nonce.
/// `key` is the operator-provided 32-byte secret; never derived or stored
/// alongside the ciphertext.
fn encrypt_bytes(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    use aes_gcm::{
        aead::{Aead, KeyInit},
        Aes256Gcm, Nonce,
    };
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| EngramError::Internal(e.to_string()))?;
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, data).map_err(|e| EngramError::Internal(format!("encryption failed: {e}")))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_bytes(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    use aes_gcm::{
        aead::{Aead, KeyInit},
        Aes256Gcm, Nonce,
    };
    if data.len() < 12 {
        return Err(EngramError::Internal("encrypted payload too short".to_string()));
    }
    let nonce = Nonce::from_slice(&data[0..12]);
    let ciphertext = &data[12..];
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| EngramError::Internal(e.to_string()))?;
    cipher.decrypt(nonce, ciphertext).map_err(|e| EngramError::Internal(format!("decryption failed: {e}")))
}
