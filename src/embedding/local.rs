//! Deterministic, dependency-free local embedding provider.
//!
//! Used as the default provider and as the fallback when no remote API key is
//! configured. Produces the same vector for the same text on every call so
//! late-embedding (spec §4.3) and tests are reproducible without network
//! access.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use super::Embedder;
use crate::error::Result;

/// Hashing-trick TF-IDF-like embedder.
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| s.len() > 1)
            .map(String::from)
            .collect()
    }

    fn hash_token(token: &str, dimensions: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        token.hash(&mut hasher);
        (hasher.finish() as usize) % dimensions
    }

    fn hash_sign(token: &str) -> f32 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        format!("{token}_sign").hash(&mut hasher);
        if hasher.finish() % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }
}

impl Embedder for LocalEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens = Self::tokenize(text);
        let mut embedding = vec![0.0_f32; self.dimensions];

        if tokens.is_empty() {
            return Ok(embedding);
        }

        let mut tf: HashMap<String, f32> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_insert(0.0) += 1.0;
        }

        let doc_len = tokens.len() as f32;
        for (token, count) in tf {
            let tf_score = (1.0 + count / doc_len).ln();
            let idf_score = 1.0 + (token.len() as f32 * 0.1);
            let weight = tf_score * idf_score;
            let idx = Self::hash_token(&token, self.dimensions);
            let sign = Self::hash_sign(&token);
            embedding[idx] += weight * sign;
        }

        for window in tokens.windows(2) {
            let bigram = format!("{}_{}", window[0], window[1]);
            let idx = Self::hash_token(&bigram, self.dimensions);
            let sign = Self::hash_sign(&bigram);
            embedding[idx] += 0.5 * sign;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "local-tfidf"
    }

    fn ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn same_text_is_deterministic() {
        let embedder = LocalEmbedder::new(384);
        assert_eq!(embedder.embed("hello world").unwrap(), embedder.embed("hello world").unwrap());
    }

    #[test]
    fn similar_sentences_score_higher_than_unrelated() {
        let embedder = LocalEmbedder::new(384);
        let e1 = embedder.embed("the quick brown fox jumps over the lazy dog").unwrap();
        let e2 = embedder.embed("a fast brown fox leaps over a sleepy dog").unwrap();
        let e3 = embedder.embed("quantum physics and thermodynamics").unwrap();

        assert!(cosine_similarity(&e1, &e2) > cosine_similarity(&e1, &e3));
    }

    #[test]
    fn empty_text_yields_zero_vector_of_correct_length() {
        let embedder = LocalEmbedder::new(384);
        let e = embedder.embed("").unwrap();
        assert_eq!(e.len(), 384);
        assert!(e.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn non_empty_embedding_is_l2_normalized() {
        let embedder = LocalEmbedder::new(384);
        let e = embedder.embed("this is a test sentence with multiple words").unwrap();
        let norm: f32 = e.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[test]
    fn always_ready() {
        assert!(LocalEmbedder::new(384).ready());
    }
}
