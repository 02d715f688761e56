//! Dispatches MCP `tools/call` invocations to the [`MemoryService`] (spec
//! §6.1) and shapes JSON-RPC responses. This is the only place that knows
//! both the wire protocol and the service API; the Memory Service itself
//! stays transport-agnostic.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::EngramError;
use crate::service::{MemoryService, TimeQuery};
use crate::types::{ListFilters, MetadataPatch};

use super::protocol::{
    get_tool_definitions, methods, InitializeResult, McpHandler, McpRequest, McpResponse,
    ToolCallResult,
};

/// Implements [`McpHandler`] over a shared [`MemoryService`], dispatching
/// each of the ten tool names from spec §6.1 to the matching service method.
pub struct EngramMcpHandler {
    service: Arc<MemoryService>,
}

impl EngramMcpHandler {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self { service }
    }

    fn dispatch_tool(&self, name: &str, args: &Value) -> Result<Value, EngramError> {
        match name {
            "store_memory" => {
                let content = require_str(args, "content")?.to_string();
                let tags = optional_str_array(args, "tags");
                let memory_type = args.get("memory_type").and_then(Value::as_str).map(str::to_string);
                let metadata = optional_metadata(args, "metadata")?;
                let client_hostname = args.get("client_hostname").and_then(Value::as_str);
                let response = self
                    .service
                    .store_memory(content, tags, memory_type, metadata, client_hostname, None)?;
                Ok(serde_json::to_value(response)?)
            }
            "retrieve_memory" => {
                let query = require_str(args, "query")?;
                let n_results = args.get("n_results").and_then(Value::as_u64).unwrap_or(5) as usize;
                let min_similarity = args.get("min_similarity").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                let response = self.service.retrieve_memory(query, n_results, min_similarity)?;
                Ok(serde_json::to_value(response)?)
            }
            "search_by_tag" => {
                let tags = optional_str_array(args, "tags");
                let match_all = args.get("match_all").and_then(Value::as_bool).unwrap_or(false);
                let response = self.service.search_by_tag(tags, match_all)?;
                Ok(serde_json::to_value(response)?)
            }
            "search_by_time" => {
                let n_results = args.get("n_results").and_then(Value::as_u64).unwrap_or(5) as usize;
                let time_query = match (
                    args.get("query").and_then(Value::as_str),
                    args.get("start").and_then(Value::as_f64),
                    args.get("end").and_then(Value::as_f64),
                ) {
                    (Some(q), _, _) => TimeQuery::Natural(q.to_string()),
                    (None, Some(start), Some(end)) => TimeQuery::Range { start, end },
                    _ => {
                        return Err(EngramError::InvalidInput(
                            "search_by_time requires `query` or both `start` and `end`".to_string(),
                        ))
                    }
                };
                let response = self.service.search_by_time(time_query, n_results)?;
                Ok(serde_json::to_value(response)?)
            }
            "search_similar" => {
                let content_hash = require_str(args, "content_hash")?;
                let n_results = args.get("n_results").and_then(Value::as_u64).unwrap_or(5) as usize;
                let response = self.service.search_similar(content_hash, n_results)?;
                Ok(serde_json::to_value(response)?)
            }
            "delete_memory" => {
                let content_hash = require_str(args, "content_hash")?;
                let response = self.service.delete_memory(content_hash)?;
                Ok(serde_json::to_value(response)?)
            }
            "delete_by_tag" => {
                let tag = require_str(args, "tag")?;
                let response = self.service.delete_by_tag(tag)?;
                Ok(serde_json::to_value(response)?)
            }
            "update_memory_metadata" => {
                let content_hash = require_str(args, "content_hash")?;
                let patch = MetadataPatch {
                    metadata: optional_metadata(args, "metadata").ok(),
                    tags: args.get("tags").map(|_| optional_str_array(args, "tags")),
                    memory_type: args.get("memory_type").and_then(Value::as_str).map(str::to_string),
                };
                let response = self.service.update_memory_metadata(content_hash, patch)?;
                Ok(serde_json::to_value(response)?)
            }
            "list_memories" => {
                let page = args.get("page").and_then(Value::as_u64).unwrap_or(1) as usize;
                let page_size = args.get("page_size").and_then(Value::as_u64).unwrap_or(10) as usize;
                let filters = ListFilters {
                    tag: args.get("tag").and_then(Value::as_str).map(str::to_string),
                    memory_type: args.get("memory_type").and_then(Value::as_str).map(str::to_string),
                };
                let response = self.service.list_memories(page, page_size, filters)?;
                Ok(serde_json::to_value(response)?)
            }
            "check_database_health" => {
                let response = self.service.check_database_health()?;
                Ok(serde_json::to_value(response)?)
            }
            other => Err(EngramError::InvalidInput(format!("unknown tool: {other}"))),
        }
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, EngramError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngramError::InvalidInput(format!("missing required argument: {key}")))
}

fn optional_str_array(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn optional_metadata(args: &Value, key: &str) -> Result<HashMap<String, Value>, EngramError> {
    match args.get(key) {
        None => Ok(HashMap::new()),
        Some(Value::Object(map)) => Ok(map.clone().into_iter().collect()),
        Some(_) => Err(EngramError::InvalidInput(format!("{key} must be an object"))),
    }
}

impl McpHandler for EngramMcpHandler {
    fn handle_request(&self, request: McpRequest) -> McpResponse {
        match request.method.as_str() {
            methods::INITIALIZE => {
                McpResponse::success(request.id, serde_json::to_value(InitializeResult::default()).unwrap_or(Value::Null))
            }
            methods::INITIALIZED => McpResponse::success(request.id, Value::Null),
            methods::LIST_TOOLS => {
                let tools = get_tool_definitions();
                McpResponse::success(request.id, serde_json::json!({ "tools": tools }))
            }
            methods::CALL_TOOL => {
                let name = match request.params.get("name").and_then(Value::as_str) {
                    Some(n) => n.to_string(),
                    None => {
                        return McpResponse::from_error(
                            request.id,
                            EngramError::InvalidInput("missing tool name".to_string()),
                        )
                    }
                };
                let empty = Value::Object(Default::default());
                let args = request.params.get("arguments").unwrap_or(&empty);

                match self.dispatch_tool(&name, args) {
                    Ok(value) => {
                        let result = ToolCallResult::json(&value);
                        McpResponse::success(request.id, serde_json::to_value(result).unwrap_or(Value::Null))
                    }
                    Err(e) => McpResponse::from_error(request.id, e),
                }
            }
            other => McpResponse::error(request.id, -32601, format!("method not found: {other}")),
        }
    }
}
