//! The embedding provider (spec §4.3): fixed-dimension vectors, an LRU cache
//! keyed by content hash, and a bounded in-flight window for backpressure.

pub mod cache;
mod local;
mod queue;

pub use cache::{EmbeddingCache, EmbeddingCacheStats};
pub use local::LocalEmbedder;
pub use queue::{EmbeddingQueue, QueueSlot};

use std::sync::Arc;

use crate::error::{EngramError, Result};
use crate::identity;

/// Configuration for constructing an `Embedder` (spec §6.4 `embedding.*`).
#[derive(Debug, Clone)]
pub struct EmbeddingProviderConfig {
    /// "local" (default, no network) or "openai" (remote, requires api_key).
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub openai_model: String,
    pub dimensions: usize,
    pub cache_size: usize,
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            model: "local".to_string(),
            api_key: None,
            base_url: None,
            openai_model: "text-embedding-3-small".to_string(),
            dimensions: 384,
            cache_size: 1024,
        }
    }
}

/// Capability every embedding provider satisfies (spec §4.3).
pub trait Embedder: Send + Sync {
    /// Embed a single piece of text.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts; must equal the serial result element-wise.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Stable vector dimension for the lifetime of the process.
    fn dimensions(&self) -> usize;

    /// Model identifier surfaced in `get_stats`.
    fn model_name(&self) -> &str;

    /// Whether the provider can currently serve `embed` calls. A
    /// provider that is never ready (e.g. missing credentials) degrades
    /// semantic search rather than failing writes (spec §4.3).
    fn ready(&self) -> bool {
        true
    }

    /// Cache hit/miss observability, surfaced through `get_stats` (spec
    /// §4.11). `None` for providers with no cache of their own.
    fn cache_stats(&self) -> Option<EmbeddingCacheStats> {
        None
    }
}

/// Wraps any `Embedder` with an LRU content-hash cache and a bounded
/// in-flight window, so callers get caching and backpressure regardless of
/// which concrete provider is configured.
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    cache: EmbeddingCache,
    queue: EmbeddingQueue,
}

impl CachingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache_size_entries: usize) -> Self {
        // EmbeddingCache is capacity-in-bytes; approximate entries * dims * 4B.
        let approx_bytes = cache_size_entries.max(1) * inner.dimensions().max(1) * 4;
        Self {
            inner,
            cache: EmbeddingCache::new(approx_bytes),
            queue: EmbeddingQueue::default(),
        }
    }

    pub fn cache_stats(&self) -> EmbeddingCacheStats {
        self.cache.stats()
    }
}

impl Embedder for CachingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = identity::content_hash(text);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.to_vec());
        }

        let _slot = self.queue.acquire()?;
        let embedding = self.inner.embed(text)?;
        self.cache.put(key, embedding.clone());
        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let _slot = self.queue.acquire()?;
        let mut out = Vec::with_capacity(texts.len());
        let mut uncached_idx = Vec::new();
        let mut uncached_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = identity::content_hash(text);
            match self.cache.get(&key) {
                Some(v) => out.push(Some(v.to_vec())),
                None => {
                    out.push(None);
                    uncached_idx.push(i);
                    uncached_texts.push(*text);
                }
            }
        }

        if !uncached_texts.is_empty() {
            let fresh = self.inner.embed_batch(&uncached_texts)?;
            for (idx, embedding) in uncached_idx.into_iter().zip(fresh.into_iter()) {
                let key = identity::content_hash(texts[idx]);
                self.cache.put(key, embedding.clone());
                out[idx] = Some(embedding);
            }
        }

        Ok(out.into_iter().map(|o| o.unwrap_or_default()).collect())
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn ready(&self) -> bool {
        self.inner.ready()
    }

    fn cache_stats(&self) -> Option<EmbeddingCacheStats> {
        Some(self.cache.stats())
    }
}

/// Remote OpenAI-compatible embedding provider.
#[cfg(feature = "openai")]
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[cfg(feature = "openai")]
impl OpenAIEmbedder {
    pub fn new(api_key: String, model: String, dimensions: usize, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            dimensions,
        }
    }

    async fn embed_async(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_batch_async(&[text]).await?.remove(0))
    }

    async fn embed_batch_async(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(2048) {
            let response = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&serde_json::json!({ "input": chunk, "model": self.model }))
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(EngramError::BackendUnavailable(format!(
                    "embedding API error {status}: {body}"
                )));
            }

            let data: serde_json::Value = response.json().await?;
            let embeddings: Vec<Vec<f32>> = data["data"]
                .as_array()
                .ok_or_else(|| EngramError::Internal("malformed embedding response".to_string()))?
                .iter()
                .map(|item| {
                    item["embedding"]
                        .as_array()
                        .map(|arr| arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
                        .unwrap_or_default()
                })
                .collect();
            all.extend(embeddings);
        }
        Ok(all)
    }
}

#[cfg(feature = "openai")]
impl Embedder for OpenAIEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(self.embed_async(text)))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.embed_batch_async(texts))
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Build an `Embedder` from configuration, wrapped in caching/backpressure.
pub fn create_embedder(config: &EmbeddingProviderConfig) -> Result<Arc<dyn Embedder>> {
    let inner: Arc<dyn Embedder> = match config.model.as_str() {
        "local" => Arc::new(LocalEmbedder::new(config.dimensions)),
        #[cfg(feature = "openai")]
        "openai" => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| EngramError::InvalidInput("openai embedding model requires an api key".to_string()))?;
            Arc::new(OpenAIEmbedder::new(
                api_key,
                config.openai_model.clone(),
                config.dimensions,
                config.base_url.clone(),
            ))
        }
        other => {
            return Err(EngramError::InvalidInput(format!(
                "unknown embedding model: {other}"
            )))
        }
    };
    Ok(Arc::new(CachingEmbedder::new(inner, config.cache_size)))
}

/// Raw cosine similarity in `[-1, 1]`. Callers that need the wire-facing
/// `[0, 1]` score use [`crate::query::rescale_similarity`].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_extremes() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn caching_embedder_hits_cache_on_repeat_input() {
        let inner: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(32));
        let embedder = CachingEmbedder::new(inner, 16);
        let e1 = embedder.embed("repeat me").unwrap();
        let e2 = embedder.embed("repeat me").unwrap();
        assert_eq!(e1, e2);
        assert_eq!(embedder.cache_stats().hits, 1);
    }

    #[test]
    fn unknown_model_is_invalid_input() {
        let config = EmbeddingProviderConfig {
            model: "not-a-real-model".to_string(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
