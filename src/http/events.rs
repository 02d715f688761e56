//! Change-feed event shape for the `/api/events` SSE stream (spec §6.2).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    MemoryStored,
    MemoryDeleted,
    MemoryUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: ChangeEventType,
    pub content_hash: String,
    pub timestamp: f64,
}

impl ChangeEvent {
    pub fn stored(content_hash: impl Into<String>) -> Self {
        Self { event_type: ChangeEventType::MemoryStored, content_hash: content_hash.into(), timestamp: crate::identity::now() }
    }

    pub fn deleted(content_hash: impl Into<String>) -> Self {
        Self { event_type: ChangeEventType::MemoryDeleted, content_hash: content_hash.into(), timestamp: crate::identity::now() }
    }

    pub fn updated(content_hash: impl Into<String>) -> Self {
        Self { event_type: ChangeEventType::MemoryUpdated, content_hash: content_hash.into(), timestamp: crate::identity::now() }
    }
}
