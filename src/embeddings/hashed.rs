//! Deterministic offline embedder
//!
//! Feature hashing over character n-grams and words, L2-normalized. No
//! network, no model download; identical input always yields the identical
//! vector, which keeps retrieval tests hermetic and gives the assistant a
//! working semantic index when no embedding endpoint is configured.

use crate::embeddings::Embedder;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MODEL_NAME: &str = "hashed-ngram-v1";

/// Feature-hashing embedder with a configurable dimension
pub struct HashedEmbedder {
    dimensions: usize,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        // Character n-grams capture morphology and misspellings
        let text_lower = text.to_lowercase();
        let chars: Vec<char> = text_lower.chars().collect();

        for window_size in 2..=4 {
            for window in chars.windows(window_size) {
                let mut hasher = DefaultHasher::new();
                window.iter().collect::<String>().hash(&mut hasher);
                let hash = hasher.finish();

                let dim = (hash as usize) % self.dimensions;
                embedding[dim] += 1.0;
            }
        }

        // Words weighted more than character n-grams
        for word in text_lower.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let hash = hasher.finish();

            let dim = (hash as usize) % self.dimensions;
            embedding[dim] += 2.0;
        }

        // Normalize
        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut embedding {
                *val /= magnitude;
            }
        }

        embedding
    }
}

#[async_trait]
impl Embedder for HashedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        MODEL_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::cosine_similarity;

    #[test]
    fn test_embedding_is_normalized() {
        let embedder = HashedEmbedder::new(384);
        let embedding = embedder.embed_sync("Rust programming language");

        assert_eq!(embedding.len(), 384);

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01, "Vector should be normalized");
    }

    #[test]
    fn test_embedding_is_deterministic() {
        let embedder = HashedEmbedder::new(384);
        let a = embedder.embed_sync("list all my GCP projects");
        let b = embedder.embed_sync("list all my GCP projects");
        assert_eq!(a, b);
    }

    #[test]
    fn test_similar_texts_have_similar_embeddings() {
        let embedder = HashedEmbedder::new(384);
        let emb1 = embedder.embed_sync("database architecture decisions");
        let emb2 = embedder.embed_sync("database design choices");
        let emb3 = embedder.embed_sync("cooking recipes");

        let sim_12 = cosine_similarity(&emb1, &emb2);
        let sim_13 = cosine_similarity(&emb1, &emb3);

        assert!(
            sim_12 > sim_13,
            "Similar texts should have higher similarity"
        );
    }

    #[test]
    fn test_empty_text_yields_zero_vector() {
        let embedder = HashedEmbedder::new(64);
        let embedding = embedder.embed_sync("");
        assert!(embedding.iter().all(|v| *v == 0.0));
    }
}
