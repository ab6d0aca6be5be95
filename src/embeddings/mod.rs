//! Embedding generation for semantic retrieval
//!
//! Two implementations of one boundary trait: a remote HTTP service and a
//! deterministic offline feature-hashing embedder. The retriever treats both
//! as a pure function text -> vector and degrades to lexical matching when
//! the boundary fails or times out.

pub mod hashed;
pub mod remote;

pub use hashed::HashedEmbedder;
pub use remote::RemoteEmbedder;

use crate::error::Result;
use async_trait::async_trait;

/// Embedding service boundary
///
/// Deterministic for identical input and model version. Dimensionality is
/// fixed per model; the store rejects vectors of any other length.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector dimensionality this embedder produces
    fn dimensions(&self) -> usize;

    /// Model identifier recorded on each stored entry
    fn model_name(&self) -> &str;
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
