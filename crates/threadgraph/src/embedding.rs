//! Embedding providers and vector math
//!
//! The provider is an external collaborator; the crate only depends on the
//! [`EmbeddingProvider`] trait. [`HashEmbeddingProvider`] is a deterministic
//! stand-in for tests and demos.

use crate::error::{MemoryError, MemoryResult};

/// Cosine similarity of two vectors, 0.0 when either is zero or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Trait for embedding generation backends
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text (queries)
    async fn embed_one(&self, text: &str) -> MemoryResult<Vec<f32>>;

    /// Embed a batch of texts (stored content), preserving order
    async fn embed_many(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed_one(text).await?);
        }
        Ok(vectors)
    }

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimensions
    fn dimensions(&self) -> usize;
}

/// Check that a provider answered one vector of the right size per text
pub fn check_batch(texts: &[String], vectors: &[Vec<f32>], dimensions: usize) -> MemoryResult<()> {
    if texts.len() != vectors.len() {
        return Err(MemoryError::embedding(format!(
            "requested {} embeddings, received {}",
            texts.len(),
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(MemoryError::embedding(format!(
            "expected {} dimensions, received {}",
            dimensions,
            bad.len()
        )));
    }
    Ok(())
}

/// Simple embedding provider that uses hash-based vectors (for testing/demo)
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    /// Create a new hash-based embedding provider
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Generate a simple hash-based embedding (NOT for production!)
    fn hash_embed(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        (0..self.dimensions)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                i.hash(&mut hasher);
                // Normalize to [-1, 1]
                ((hasher.finish() as f32) / (u64::MAX as f32)) * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed_one(&self, text: &str) -> MemoryResult<Vec<f32>> {
        Ok(self.hash_embed(text))
    }

    fn model_name(&self) -> &str {
        "hash-embedding"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
