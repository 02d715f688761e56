//! The canonical data model: `Memory`, `MemoryQueryResult`, and the tag
//! normalization contract (spec §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::identity;

/// Metadata key carrying the originating hostname, set by hostname tagging.
pub const META_HOSTNAME: &str = "hostname";
/// Metadata key recording where a record was ingested from.
pub const META_SOURCE: &str = "source";
/// Metadata key pointing at an externally spilled large-content blob.
pub const META_LARGE_CONTENT_REF: &str = "large_content_ref";
/// Metadata key recording the original byte length of spilled content.
pub const META_ORIGINAL_LENGTH: &str = "original_length";

/// Maximum inline content size before large-object spill is considered
/// (backends that don't support spill simply reject larger content).
pub const MAX_INLINE_CONTENT_BYTES: usize = 1024 * 1024;

fn default_memory_type() -> String {
    "note".to_string()
}

/// A content-addressed, tagged text record with timestamps and an optional
/// vector embedding.
///
/// `content_hash` is the primary identity (spec §4.1): two `Memory` values
/// with the same `content` always have the same `content_hash`, regardless
/// of tags, metadata, or memory_type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub content: String,
    pub content_hash: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_memory_type", rename = "memory_type")]
    pub memory_type: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: f64,
    pub created_at_iso: String,
    pub updated_at: f64,
    pub updated_at_iso: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Memory {
    /// Build a new, freshly-timestamped Memory, applying the full
    /// normalization policy from spec §4.2:
    /// - tags are trimmed, collapsed, deduplicated, order-preserved
    /// - metadata string values are trimmed
    /// - `content_hash` is lower-cased and computed from `content` if absent
    /// - empty normalized content is rejected
    pub fn new(
        content: String,
        tags: Vec<String>,
        memory_type: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        if content.trim().is_empty() {
            return Err(EngramError::InvalidInput(
                "content must not be empty".to_string(),
            ));
        }
        if content.len() > MAX_INLINE_CONTENT_BYTES {
            return Err(EngramError::InvalidInput(format!(
                "content exceeds {MAX_INLINE_CONTENT_BYTES} bytes without large-object spill configured"
            )));
        }

        let tags = normalize_tags(tags)?;
        let metadata = normalize_metadata(metadata)?;
        let content_hash = identity::content_hash(&content);
        let now = identity::now();
        let now_iso = identity::to_rfc3339(now);

        Ok(Self {
            content,
            content_hash,
            tags,
            memory_type: memory_type.unwrap_or_else(default_memory_type),
            metadata,
            created_at: now,
            created_at_iso: now_iso.clone(),
            updated_at: now,
            updated_at_iso: now_iso,
            embedding: None,
        })
    }

    /// Whether `tag` appears in this memory's normalized tag set.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Stamp `updated_at`/`updated_at_iso` to the current time.
    pub fn touch(&mut self) {
        self.updated_at = identity::now();
        self.updated_at_iso = identity::to_rfc3339(self.updated_at);
    }
}

/// Normalize a single tag per spec §3: trim outer whitespace, collapse
/// internal whitespace runs to a single space, reject empty results.
pub fn normalize_tag(raw: &str) -> Result<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(EngramError::InvalidInput(format!(
            "tag normalizes to empty string: {raw:?}"
        )));
    }
    Ok(collapsed)
}

/// Normalize a whole tag set: normalize each tag, then deduplicate while
/// preserving first-seen order.
pub fn normalize_tags(raw: Vec<String>) -> Result<Vec<String>> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for tag in raw {
        let normalized = normalize_tag(&tag)?;
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    Ok(out)
}

/// Validate and trim metadata: string values are trimmed; only
/// string/number/boolean/null values are accepted (spec §3).
pub fn normalize_metadata(
    raw: HashMap<String, serde_json::Value>,
) -> Result<HashMap<String, serde_json::Value>> {
    let mut out = HashMap::with_capacity(raw.len());
    for (key, value) in raw {
        let normalized = match value {
            serde_json::Value::String(s) => serde_json::Value::String(s.trim().to_string()),
            v @ (serde_json::Value::Number(_)
            | serde_json::Value::Bool(_)
            | serde_json::Value::Null) => v,
            other => {
                return Err(EngramError::InvalidInput(format!(
                    "metadata key {key:?} has non-scalar value {other:?}; only string, number, boolean, or null are allowed"
                )))
            }
        };
        out.insert(key, normalized);
    }
    Ok(out)
}

/// A Memory plus its similarity ranking context, returned by semantic and
/// similarity queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryQueryResult {
    #[serde(flatten)]
    pub memory: Memory,
    pub similarity_score: f32,
    pub relevance_reason: String,
}

impl MemoryQueryResult {
    pub fn new(memory: Memory, similarity_score: f32, relevance_reason: impl Into<String>) -> Self {
        Self {
            memory,
            similarity_score,
            relevance_reason: relevance_reason.into(),
        }
    }
}

/// Input to `update_metadata`: only present fields are applied. Per spec §9's
/// resolved Open Question, a present `tags` field *replaces* the tag set
/// rather than merging with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    pub tags: Option<Vec<String>>,
    pub memory_type: Option<String>,
}

/// Filters accepted by `list_memories` (spec §4.4/§6.1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilters {
    pub tag: Option<String>,
    pub memory_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_content() {
        assert!(Memory::new(" \n\t ".into(), vec![], None, HashMap::new()).is_err());
    }

    #[test]
    fn defaults_memory_type_to_note() {
        let m = Memory::new("hello".into(), vec![], None, HashMap::new()).unwrap();
        assert_eq!(m.memory_type, "note");
        assert_eq!(m.created_at, m.updated_at);
    }

    #[test]
    fn tag_normalization_dedupes_and_trims() {
        let tags = vec![" bug ".to_string(), "bug".to_string(), "  multi  word ".to_string()];
        let normalized = normalize_tags(tags).unwrap();
        assert_eq!(normalized, vec!["bug".to_string(), "multi word".to_string()]);
    }

    #[test]
    fn empty_tag_after_normalization_is_rejected() {
        assert!(normalize_tag("   ").is_err());
    }

    #[test]
    fn metadata_rejects_nested_structures() {
        let mut meta = HashMap::new();
        meta.insert("bad".to_string(), serde_json::json!({"nested": true}));
        assert!(normalize_metadata(meta).is_err());
    }

    #[test]
    fn identity_is_independent_of_metadata() {
        let mut m1 = HashMap::new();
        m1.insert("hostname".to_string(), serde_json::json!("a"));
        let mut m2 = HashMap::new();
        m2.insert("hostname".to_string(), serde_json::json!("b"));

        let a = Memory::new("same content".into(), vec![], None, m1).unwrap();
        let b = Memory::new("same content".into(), vec![], None, m2).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }
}
