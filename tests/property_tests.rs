//! Property-based tests for the universal invariants from spec §8 (P1-P8).
//!
//! Run with: cargo test --test property_tests

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use engram::embedding::{Embedder, LocalEmbedder};
use engram::service::{MemoryService, ServiceConfig};
use engram::storage::{SqliteBackend, StorageBackend};
use engram::types::{Memory, ListFilters};

fn service() -> MemoryService {
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(48));
    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory(embedder.clone()).unwrap());
    MemoryService::new(backend, embedder, ServiceConfig::default()).unwrap()
}

fn non_blank_content() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ,.!?-]{1,120}".prop_filter("must not be blank after trim", |s| !s.trim().is_empty())
}

// ============================================================================
// P1: identity is independent of metadata
// ============================================================================

mod identity_tests {
    use super::*;

    proptest! {
        #[test]
        fn hash_ignores_metadata(content in non_blank_content(), a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            let mut meta_a = HashMap::new();
            meta_a.insert("tag".to_string(), serde_json::json!(a));
            let mut meta_b = HashMap::new();
            meta_b.insert("tag".to_string(), serde_json::json!(b));

            let m1 = Memory::new(content.clone(), vec![], None, meta_a).unwrap();
            let m2 = Memory::new(content, vec![], None, meta_b).unwrap();
            prop_assert_eq!(m1.content_hash, m2.content_hash);
        }
    }
}

// ============================================================================
// P2: dedup
// ============================================================================

mod dedup_tests {
    use super::*;

    proptest! {
        #[test]
        fn storing_twice_keeps_one_row(content in non_blank_content()) {
            let service = service();
            let first = service.store_memory(content.clone(), vec![], None, HashMap::new(), None, None).unwrap();
            let second = service.store_memory(content, vec![], None, HashMap::new(), None, None).unwrap();
            prop_assert_eq!(&first.content_hash, &second.content_hash);

            let listed = service.list_memories(1, 100, ListFilters::default()).unwrap();
            let count = listed.results.iter().filter(|m| m.content_hash == first.content_hash).count();
            prop_assert_eq!(count, 1);
        }
    }
}

// ============================================================================
// P3: tag AND is a subset of tag OR
// ============================================================================

mod tag_tests {
    use super::*;

    proptest! {
        #[test]
        fn and_results_are_subset_of_or_results(
            tag_sets in prop::collection::vec(prop::collection::vec("[a-z]{1,6}", 1..3), 1..6),
        ) {
            let service = service();
            for (i, tags) in tag_sets.iter().enumerate() {
                service.store_memory(format!("memory number {i}"), tags.clone(), None, HashMap::new(), None, None).unwrap();
            }

            let query_tags: Vec<String> = tag_sets[0].clone();
            let and_result = service.search_by_tag(query_tags.clone(), true).unwrap();
            let or_result = service.search_by_tag(query_tags.clone(), false).unwrap();

            let or_hashes: std::collections::HashSet<_> = or_result.results.iter().map(|m| m.content_hash.clone()).collect();
            for memory in &and_result.results {
                prop_assert!(or_hashes.contains(&memory.content_hash));
                let tag_set: std::collections::HashSet<_> = memory.tags.iter().cloned().collect();
                let query_set: std::collections::HashSet<_> = query_tags.iter().cloned().collect();
                prop_assert!(query_set.is_subset(&tag_set));
            }
        }
    }
}

// ============================================================================
// P4: store/list round-trip preserves tags and metadata string values
// ============================================================================

mod round_trip_tests {
    use super::*;

    proptest! {
        #[test]
        fn listed_record_matches_what_was_stored(
            content in non_blank_content(),
            tags in prop::collection::vec("[a-z]{1,8}", 0..4),
            meta_value in "[a-zA-Z0-9 ]{0,20}",
        ) {
            let service = service();
            let mut metadata = HashMap::new();
            metadata.insert("note".to_string(), serde_json::json!(meta_value.clone()));

            let stored = service.store_memory(content, tags.clone(), None, metadata, None, None).unwrap();
            let listed = service.list_memories(1, 200, ListFilters::default()).unwrap();
            let found = listed.results.iter().find(|m| m.content_hash == stored.content_hash).unwrap();

            let mut expected_tags = tags;
            expected_tags.dedup();
            prop_assert_eq!(&found.metadata.get("note").and_then(|v| v.as_str()).unwrap_or(""), &meta_value.trim());
            for tag in &expected_tags {
                prop_assert!(found.tags.contains(tag));
            }
        }
    }
}

// ============================================================================
// P5: ranking is monotonically non-increasing in similarity_score
// ============================================================================

mod ranking_tests {
    use super::*;

    proptest! {
        #[test]
        fn retrieve_results_are_sorted_descending(count in 3usize..12) {
            let service = service();
            for i in 0..count {
                service
                    .store_memory(format!("entry {i} about topic number {}", i % 4), vec![], None, HashMap::new(), None, None)
                    .unwrap();
            }
            let results = service.retrieve_memory("topic number 2", count, 0.0).unwrap().results;
            for pair in results.windows(2) {
                prop_assert!(pair[0].similarity_score >= pair[1].similarity_score);
            }
        }
    }
}

// ============================================================================
// P6: pagination covers every record exactly once
// ============================================================================

mod pagination_tests {
    use super::*;

    proptest! {
        #[test]
        fn pages_concatenate_to_the_full_set(total in 1usize..20, page_size in 1usize..7) {
            let service = service();
            let mut hashes = Vec::with_capacity(total);
            for i in 0..total {
                let response = service.store_memory(format!("paginated entry {i}"), vec![], None, HashMap::new(), None, None).unwrap();
                hashes.push(response.content_hash);
            }

            let mut seen = Vec::new();
            let mut page = 1;
            loop {
                let response = service.list_memories(page, page_size, ListFilters::default()).unwrap();
                if response.results.is_empty() {
                    break;
                }
                seen.extend(response.results.iter().map(|m| m.content_hash.clone()));
                if !response.has_more {
                    break;
                }
                page += 1;
            }

            let mut seen_sorted = seen.clone();
            seen_sorted.sort();
            let mut hashes_sorted = hashes.clone();
            hashes_sorted.sort();
            prop_assert_eq!(seen.len(), total);
            prop_assert_eq!(seen_sorted, hashes_sorted);
        }
    }
}

// ============================================================================
// P8: late embedding
// ============================================================================

mod late_embedding_tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps `LocalEmbedder` with a readiness flag the test can flip, so a
    /// write made while the provider is "down" can be embedded later on read
    /// without the caller doing anything special (spec §4.3).
    struct FlakyEmbedder {
        inner: LocalEmbedder,
        ready: Arc<AtomicBool>,
    }

    impl Embedder for FlakyEmbedder {
        fn embed(&self, text: &str) -> engram::error::Result<Vec<f32>> {
            self.inner.embed(text)
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
        fn model_name(&self) -> &str {
            "flaky-local"
        }
        fn ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    proptest! {
        #[test]
        fn record_becomes_searchable_once_provider_recovers(content in non_blank_content()) {
            let ready = Arc::new(AtomicBool::new(false));
            let embedder: Arc<dyn Embedder> = Arc::new(FlakyEmbedder { inner: LocalEmbedder::new(48), ready: ready.clone() });
            let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory(embedder.clone()).unwrap());
            let service = MemoryService::new(backend, embedder, ServiceConfig::default()).unwrap();

            let stored = service.store_memory(content.clone(), vec![], None, HashMap::new(), None, None).unwrap();

            // Provider down: semantic search degrades to empty rather than failing.
            let degraded = service.retrieve_memory(&content, 5, 0.0).unwrap();
            prop_assert!(degraded.results.is_empty());

            ready.store(true, Ordering::SeqCst);
            let recovered = service.retrieve_memory(&content, 5, 0.0).unwrap();
            prop_assert!(recovered.results.iter().any(|r| r.memory.content_hash == stored.content_hash));
        }
    }
}

// ============================================================================
// P7: delete atomicity
// ============================================================================

mod delete_tests {
    use super::*;

    proptest! {
        #[test]
        fn deleted_record_is_unobservable(content in non_blank_content(), tag in "[a-z]{1,8}") {
            let service = service();
            let stored = service.store_memory(content, vec![tag.clone()], None, HashMap::new(), None, None).unwrap();
            service.delete_memory(&stored.content_hash).unwrap();

            let listed = service.list_memories(1, 200, ListFilters::default()).unwrap();
            prop_assert!(listed.results.iter().all(|m| m.content_hash != stored.content_hash));

            let by_tag = service.search_by_tag(vec![tag], false).unwrap();
            prop_assert!(by_tag.results.iter().all(|m| m.content_hash != stored.content_hash));
        }
    }
}
