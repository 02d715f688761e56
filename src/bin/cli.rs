//! Engram CLI: a thin command-line client over the embedded backend, for
//! local inspection and scripting. Every subcommand goes through the same
//! `MemoryService` the MCP and HTTP transports use.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use engram::embedding::{create_embedder, EmbeddingProviderConfig};
use engram::error::Result;
use engram::service::{MemoryService, ServiceConfig, TimeQuery};
use engram::storage::{SqliteBackend, SqliteConfig, StorageBackend, StorageMode};
use engram::types::ListFilters;

#[derive(Parser)]
#[command(name = "engram")]
#[command(about = "Engram memory service CLI")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(long, env = "ENGRAM_DB_PATH", default_value = "~/.local/share/engram/memories.db")]
    db_path: String,

    /// Use the Dropbox/OneDrive/iCloud-safe journaling mode instead of WAL.
    #[arg(long, env = "ENGRAM_CLOUD_SAFE_JOURNAL")]
    cloud_safe_journal: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new memory
    Store {
        content: String,
        #[arg(short = 'T', long)]
        tags: Option<String>,
        #[arg(short = 't', long, default_value = "note")]
        memory_type: String,
    },
    /// Semantic retrieval
    Retrieve {
        query: String,
        #[arg(short, long, default_value_t = 5)]
        n: usize,
        #[arg(long, default_value_t = 0.0)]
        min_similarity: f32,
    },
    /// Tag search
    Tag {
        tags: String,
        #[arg(long)]
        match_all: bool,
    },
    /// Time search
    Time {
        /// Natural-language query, e.g. "yesterday" or "3 days ago"
        query: String,
        #[arg(short, long, default_value_t = 5)]
        n: usize,
    },
    /// Similar-to search
    Similar {
        content_hash: String,
        #[arg(short, long, default_value_t = 5)]
        n: usize,
    },
    /// Delete a memory by content_hash
    Delete { content_hash: String },
    /// Delete every memory with the given tag
    DeleteByTag { tag: String },
    /// List memories, newest first
    List {
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        #[arg(short = 's', long, default_value_t = 10)]
        page_size: usize,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        memory_type: Option<String>,
    },
    /// Show backend health and statistics
    Health,
}

fn build_service(cli: &Cli) -> Result<MemoryService> {
    let embedder = create_embedder(&EmbeddingProviderConfig::default())?;
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    let storage_mode = if cli.cloud_safe_journal { StorageMode::CloudSafe } else { StorageMode::Local };
    let config = SqliteConfig {
        db_path,
        storage_mode,
        extra_pragmas: Vec::new(),
        embedding_dimension: embedder.dimensions(),
    };
    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(config, embedder.clone())?);
    MemoryService::new(backend, embedder, ServiceConfig::default())
}

fn parse_tags(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|t| t.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    let first_line = s.lines().next().unwrap_or(s);
    if first_line.len() <= max {
        first_line.to_string()
    } else {
        format!("{}...", &first_line[..max.saturating_sub(3)])
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let service = build_service(&cli)?;

    match cli.command {
        Commands::Store { content, tags, memory_type } => {
            let response = service.store_memory(content, parse_tags(&tags), Some(memory_type), HashMap::new(), None, None)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Retrieve { query, n, min_similarity } => {
            let response = service.retrieve_memory(&query, n, min_similarity)?;
            for result in &response.results {
                println!(
                    "{} ({:.3}) [{}] {}",
                    &result.memory.content_hash[..12],
                    result.similarity_score,
                    result.relevance_reason,
                    truncate(&result.memory.content, 60)
                );
            }
        }
        Commands::Tag { tags, match_all } => {
            let response = service.search_by_tag(parse_tags(&Some(tags)), match_all)?;
            for memory in &response.results {
                println!("{} [{}] {}", &memory.content_hash[..12], memory.tags.join(", "), truncate(&memory.content, 60));
            }
        }
        Commands::Time { query, n } => {
            let response = service.search_by_time(TimeQuery::Natural(query), n)?;
            for memory in &response.results {
                println!("{} ({}) {}", &memory.content_hash[..12], memory.created_at_iso, truncate(&memory.content, 60));
            }
        }
        Commands::Similar { content_hash, n } => {
            let response = service.search_similar(&content_hash, n)?;
            for result in &response.results {
                println!("{} ({:.3}) {}", &result.memory.content_hash[..12], result.similarity_score, truncate(&result.memory.content, 60));
            }
        }
        Commands::Delete { content_hash } => {
            let response = service.delete_memory(&content_hash)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::DeleteByTag { tag } => {
            let response = service.delete_by_tag(&tag)?;
            println!("deleted {} memories", response.deleted_count);
        }
        Commands::List { page, page_size, tag, memory_type } => {
            let filters = ListFilters { tag, memory_type };
            let response = service.list_memories(page, page_size, filters)?;
            for memory in &response.results {
                println!("{} [{}] {}", &memory.content_hash[..12], memory.memory_type, truncate(&memory.content, 60));
            }
            let total_pages = (response.total as usize).div_ceil(response.page_size.max(1));
            println!("page {}/{} (total {})", response.page, total_pages, response.total);
        }
        Commands::Health => {
            let report = service.check_database_health()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
