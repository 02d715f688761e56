//! MCP tool definitions for Engram: the ten operations of the Memory
//! Service's tool/RPC surface (spec §6.1). Every transport presents the same
//! ten names and schemas; only the framing differs.

use serde_json::json;

use super::protocol::ToolDefinition;

/// All tool definitions for Engram: `(name, description, input_schema_json)`.
pub const TOOL_DEFINITIONS: &[(&str, &str, &str)] = &[
    (
        "store_memory",
        "Store a new memory. Content is the only required field; tags, memory_type, and metadata are optional.",
        r#"{
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The content to remember"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Tags for categorization"},
                "memory_type": {"type": "string", "default": "note", "description": "Free-form memory type label"},
                "metadata": {"type": "object", "description": "Additional metadata (string, number, boolean, or null values only)"},
                "client_hostname": {"type": "string", "description": "Explicit hostname to tag this memory with, overriding the process identity"}
            },
            "required": ["content"]
        }"#,
    ),
    (
        "retrieve_memory",
        "Semantic nearest-neighbor retrieval: find memories whose content is most similar to the query.",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Natural-language query text"},
                "n_results": {"type": "integer", "default": 5, "description": "Maximum number of results"},
                "min_similarity": {"type": "number", "default": 0.0, "minimum": 0, "maximum": 1, "description": "Drop results below this similarity score"}
            },
            "required": ["query"]
        }"#,
    ),
    (
        "search_by_tag",
        "Find memories carrying the given tags. match_all=true requires every tag (AND); match_all=false requires any one of them (OR).",
        r#"{
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}, "description": "Tags to search for"},
                "match_all": {"type": "boolean", "default": false, "description": "Require all tags (AND) instead of any (OR)"}
            },
            "required": ["tags"]
        }"#,
    ),
    (
        "search_by_time",
        "Find memories created within a time range, expressed either as a natural-language query string or an explicit epoch-second range.",
        r#"{
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Natural-language time expression, e.g. 'yesterday', '3 days ago', 'between 2024-01-01 and 2024-01-31'"},
                "start": {"type": "number", "description": "Explicit range start, epoch seconds (use instead of query)"},
                "end": {"type": "number", "description": "Explicit range end, epoch seconds (use instead of query)"},
                "n_results": {"type": "integer", "default": 5, "description": "Maximum number of results"}
            }
        }"#,
    ),
    (
        "search_similar",
        "Find memories similar to an existing memory, identified by its content_hash, excluding the source memory itself.",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string", "description": "content_hash of the source memory"},
                "n_results": {"type": "integer", "default": 5, "description": "Maximum number of results"}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "delete_memory",
        "Delete a single memory by its content_hash, along with its tag and vector relations.",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string", "description": "content_hash of the memory to delete"}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "delete_by_tag",
        "Delete every memory carrying the given tag. Returns the number of memories deleted.",
        r#"{
            "type": "object",
            "properties": {
                "tag": {"type": "string", "description": "Tag whose memories should be deleted"}
            },
            "required": ["tag"]
        }"#,
    ),
    (
        "update_memory_metadata",
        "Update a memory's metadata, tags, or memory_type in place. A present `tags` field replaces the tag set; metadata fields are merged.",
        r#"{
            "type": "object",
            "properties": {
                "content_hash": {"type": "string", "description": "content_hash of the memory to update"},
                "metadata": {"type": "object", "description": "Metadata keys to merge in"},
                "tags": {"type": "array", "items": {"type": "string"}, "description": "If present, replaces the memory's tag set entirely"},
                "memory_type": {"type": "string", "description": "If present, replaces the memory_type"}
            },
            "required": ["content_hash"]
        }"#,
    ),
    (
        "list_memories",
        "Paginated listing of memories, newest first, optionally filtered by tag or memory_type.",
        r#"{
            "type": "object",
            "properties": {
                "page": {"type": "integer", "default": 1, "minimum": 1, "description": "1-indexed page number"},
                "page_size": {"type": "integer", "default": 10, "minimum": 1, "description": "Results per page"},
                "tag": {"type": "string", "description": "Filter to memories carrying this tag"},
                "memory_type": {"type": "string", "description": "Filter to memories of this memory_type"}
            }
        }"#,
    ),
    (
        "check_database_health",
        "Report backend health and aggregate statistics: memory/tag counts, storage size, embedding model and dimension, and backend-specific details.",
        r#"{
            "type": "object",
            "properties": {}
        }"#,
    ),
];

/// Get all tool definitions as `ToolDefinition` structs.
pub fn get_tool_definitions() -> Vec<ToolDefinition> {
    TOOL_DEFINITIONS
        .iter()
        .map(|(name, description, schema)| ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::from_str(schema).unwrap_or(json!({})),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_exactly_the_ten_spec_operations() {
        let names: Vec<&str> = TOOL_DEFINITIONS.iter().map(|(name, _, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "store_memory",
                "retrieve_memory",
                "search_by_tag",
                "search_by_time",
                "search_similar",
                "delete_memory",
                "delete_by_tag",
                "update_memory_metadata",
                "list_memories",
                "check_database_health",
            ]
        );
    }

    #[test]
    fn every_schema_parses_as_json() {
        for definition in get_tool_definitions() {
            assert!(definition.input_schema.is_object());
        }
    }
}
