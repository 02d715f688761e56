//! Engram bench: a small standalone throughput tool for `store`/`retrieve`/
//! `search_by_tag` against the embedded backend, independent of the
//! `cargo bench` criterion harness (`benches/memory_ops.rs`). Useful for
//! quick manual sizing without a full criterion run.
//!
//! Run with: engram-bench --count 1000

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use engram::embedding::{Embedder, LocalEmbedder};
use engram::error::Result;
use engram::storage::{SqliteBackend, StorageBackend};
use engram::types::{ListFilters, Memory};

#[derive(Parser)]
#[command(name = "engram-bench")]
#[command(about = "Throughput sizing for store/retrieve/search_by_tag")]
struct Args {
    /// Number of memories to store before timing reads.
    #[arg(long, default_value_t = 1000)]
    count: usize,

    /// Embedding dimension for the local (dependency-free) embedder.
    #[arg(long, default_value_t = 256)]
    dimensions: usize,
}

fn sample_content(i: usize) -> String {
    format!(
        "bench memory #{i}: deployed service revision {i}, observed latency p99 {}ms",
        50 + (i % 200)
    )
}

fn main() -> Result<()> {
    let args = Args::parse();
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(args.dimensions));
    let backend = SqliteBackend::in_memory(embedder.clone())?;

    let start = Instant::now();
    for i in 0..args.count {
        let memory = Memory::new(sample_content(i), vec![format!("bucket-{}", i % 16)], None, HashMap::new())?;
        backend.store(memory)?;
    }
    let store_elapsed = start.elapsed();
    println!(
        "store: {} memories in {:.3}s ({:.1}/s)",
        args.count,
        store_elapsed.as_secs_f64(),
        args.count as f64 / store_elapsed.as_secs_f64().max(1e-9)
    );

    let start = Instant::now();
    let retrieved = backend.retrieve("deployed service revision", 10, 0.0)?;
    println!("retrieve: {} results in {:.3}ms", retrieved.len(), start.elapsed().as_secs_f64() * 1000.0);

    let start = Instant::now();
    let tagged = backend.search_by_tag(&["bucket-0".to_string()], false)?;
    println!("search_by_tag: {} results in {:.3}ms", tagged.len(), start.elapsed().as_secs_f64() * 1000.0);

    let start = Instant::now();
    let page = backend.list(0, 50, ListFilters::default())?;
    println!("list: {} of {} in {:.3}ms", page.items.len(), page.total, start.elapsed().as_secs_f64() * 1000.0);

    Ok(())
}
