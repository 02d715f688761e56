//! End-to-end scenario tests against the embedded backend, covering the
//! concrete scenarios from spec §8 (S1-S6). Each test builds its own
//! in-memory service so scenarios don't share state.

use std::collections::HashMap;
use std::sync::Arc;

use engram::embedding::{Embedder, LocalEmbedder};
use engram::error::EngramError;
use engram::service::{MemoryService, ServiceConfig, TimeQuery};
use engram::storage::{SqliteBackend, SqliteConfig, StorageBackend, StorageMode};
use engram::types::ListFilters;

fn service() -> MemoryService {
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(64));
    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory(embedder.clone()).unwrap());
    MemoryService::new(backend, embedder, ServiceConfig::default()).unwrap()
}

#[test]
fn s1_store_and_retrieve() {
    let service = service();
    let stored = service
        .store_memory(
            "Fixed the race condition with a mutex".to_string(),
            vec!["bug".to_string(), "concurrency".to_string()],
            None,
            HashMap::new(),
            None,
            None,
        )
        .unwrap();

    let found = service.retrieve_memory("race condition fix", 3, 0.0).unwrap();
    assert_eq!(found.results[0].memory.content_hash, stored.content_hash);
    assert!(found.results[0].similarity_score > 0.5);
    assert!(found.results[0].relevance_reason.starts_with("vector:"));
}

#[test]
fn s2_tag_and_vs_or() {
    let service = service();
    let a = service
        .store_memory("memory A".to_string(), vec!["x".to_string(), "y".to_string()], None, HashMap::new(), None, None)
        .unwrap();
    let b = service
        .store_memory("memory B".to_string(), vec!["x".to_string()], None, HashMap::new(), None, None)
        .unwrap();
    let c = service
        .store_memory("memory C".to_string(), vec!["y".to_string()], None, HashMap::new(), None, None)
        .unwrap();

    let and_result = service.search_by_tag(vec!["x".to_string(), "y".to_string()], true).unwrap();
    assert_eq!(and_result.results.len(), 1);
    assert_eq!(and_result.results[0].content_hash, a.content_hash);

    let or_result = service.search_by_tag(vec!["x".to_string(), "y".to_string()], false).unwrap();
    let or_hashes: Vec<_> = or_result.results.iter().map(|m| m.content_hash.clone()).collect();
    assert_eq!(or_hashes.len(), 3);
    assert!(or_hashes.contains(&a.content_hash));
    assert!(or_hashes.contains(&b.content_hash));
    assert!(or_hashes.contains(&c.content_hash));
    // created_at desc: C then B then A, since A was stored first.
    assert_eq!(or_hashes[0], c.content_hash);
    assert_eq!(or_hashes[1], b.content_hash);
    assert_eq!(or_hashes[2], a.content_hash);
}

#[test]
fn s3_idempotent_store() {
    let service = service();
    let first = service.store_memory("hello world".to_string(), vec![], None, HashMap::new(), None, None).unwrap();
    let second = service.store_memory("hello world".to_string(), vec![], None, HashMap::new(), None, None).unwrap();
    assert_eq!(first.content_hash, second.content_hash);

    let listed = service.list_memories(1, 10, ListFilters::default()).unwrap();
    let matching = listed.results.iter().filter(|m| m.content_hash == first.content_hash).count();
    assert_eq!(matching, 1);
}

#[test]
fn s4_delete_cascades() {
    let service = service();
    let stored = service
        .store_memory("hello, this is going away".to_string(), vec!["t".to_string()], None, HashMap::new(), None, None)
        .unwrap();

    let deleted = service.delete_memory(&stored.content_hash).unwrap();
    assert!(deleted.success);

    let by_tag = service.search_by_tag(vec!["t".to_string()], false).unwrap();
    assert!(by_tag.results.is_empty());

    let retrieved = service.retrieve_memory("hello", 5, 0.0).unwrap();
    assert!(retrieved.results.iter().all(|r| r.memory.content_hash != stored.content_hash));
}

#[test]
fn s5_time_search_explicit_range() {
    let service = service();
    // T1 < T2 < T3, one second apart, well inside [T1, T3].
    let t1 = service.store_memory("record one".to_string(), vec![], None, HashMap::new(), None, None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let t2 = service.store_memory("record two".to_string(), vec![], None, HashMap::new(), None, None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let t3 = service.store_memory("record three".to_string(), vec![], None, HashMap::new(), None, None).unwrap();

    let now = engram::identity::now();
    let results = service.search_by_time(TimeQuery::Range { start: now - 60.0, end: now + 60.0 }, 10).unwrap();
    let hashes: Vec<_> = results.results.iter().map(|m| m.content_hash.clone()).collect();
    assert!(hashes.contains(&t1.content_hash));
    assert!(hashes.contains(&t2.content_hash));
    assert!(hashes.contains(&t3.content_hash));
}

#[test]
fn s5_time_search_unparseable_query_is_invalid_input() {
    let service = service();
    let err = service.search_by_time(TimeQuery::Natural("whenever, I guess".to_string()), 5).unwrap_err();
    assert!(matches!(err, EngramError::InvalidInput(_)));
}

#[test]
fn s6_health_under_dimension_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engram.db").to_string_lossy().to_string();

    {
        let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(384));
        let config = SqliteConfig { db_path: db_path.clone(), storage_mode: StorageMode::Local, extra_pragmas: Vec::new(), embedding_dimension: 384 };
        let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(config, embedder.clone()).unwrap());
        let service = MemoryService::new(backend, embedder, ServiceConfig::default()).unwrap();
        service.store_memory("seed record".to_string(), vec!["keep".to_string()], None, HashMap::new(), None, None).unwrap();
    }

    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(768));
    let config = SqliteConfig { db_path, storage_mode: StorageMode::Local, extra_pragmas: Vec::new(), embedding_dimension: 768 };
    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(config, embedder.clone()).unwrap());
    let service = MemoryService::new(backend, embedder, ServiceConfig::default()).unwrap();

    let report = service.check_database_health().unwrap();
    assert!(!report.healthy);
    assert!(report.stats.details.contains_key("DimensionMismatch"));

    let store_err = service.store_memory("new content".to_string(), vec![], None, HashMap::new(), None, None).unwrap_err();
    assert!(matches!(store_err, EngramError::DimensionMismatch { .. }));

    let tag_search = service.search_by_tag(vec!["keep".to_string()], false).unwrap();
    assert_eq!(tag_search.results.len(), 1);
}
