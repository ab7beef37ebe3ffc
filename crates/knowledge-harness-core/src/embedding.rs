//! Embedding provider trait, the deterministic hashing provider, and
//! vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, a [`HashEmbedder`] stand-in that needs no model, plus pure
//! helper functions for vector serialization, normalization, and
//! similarity computation.
//!
//! Hosted provider implementations (OpenAI, Ollama) and the timeout
//! wrapper live in the `knowledge-harness` app crate.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;

/// Default dimensionality, matching `text-embedding-3-small`.
pub const DEFAULT_DIMS: usize = 1536;

/// Trait for embedding providers.
///
/// Implementations must be deterministic for a fixed model version and
/// return unit-length vectors of exactly [`dims`](EmbeddingProvider::dims)
/// components, so that cosine similarity reduces to a dot product and
/// content hashes stay meaningful across runs.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a document text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
    /// Embed a search query. Defaults to [`embed`](EmbeddingProvider::embed).
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text).await
    }
}

#[async_trait]
impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<P> {
    fn model_name(&self) -> &str {
        (**self).model_name()
    }
    fn dims(&self) -> usize {
        (**self).dims()
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed(text).await
    }
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        (**self).embed_query(text).await
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one
/// bucket and a sign; bucket weights are term frequencies. Texts that
/// share words therefore point in similar directions, which is enough
/// for tests and offline use. Text without any token falls back to a
/// pattern derived from the SHA-256 of the whole text.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub const MODEL_NAME: &'static str = "feature-hash-v1";

    pub fn new(dims: usize) -> Self {
        Self {
            model: Self::MODEL_NAME.to_string(),
            dims: dims.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vec = vec![0.0f32; self.dims];
        let tokens = tokenize(text);

        if tokens.is_empty() {
            let digest = Sha256::digest(text.as_bytes());
            for (i, slot) in vec.iter_mut().enumerate() {
                *slot = (digest[i % digest.len()] as f32 - 128.0) / 128.0;
            }
        } else {
            for token in &tokens {
                let digest = Sha256::digest(token.as_bytes());
                let mut bucket_bytes = [0u8; 8];
                bucket_bytes.copy_from_slice(&digest[..8]);
                let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
                let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
                vec[bucket] += sign;
            }
        }

        if !l2_normalize(&mut vec) {
            return Err(EmbeddingError::Provider(
                "hash embedding collapsed to the zero vector".to_string(),
            ));
        }
        Ok(vec)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMS)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectorize(text)
    }
}

/// Split text into lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Scale `vec` to unit length in place.
///
/// Returns `false` (leaving the vector untouched) when its norm is zero
/// or not finite.
pub fn l2_normalize(vec: &mut [f32]) -> bool {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm < f32::EPSILON {
        return false;
    }
    for x in vec.iter_mut() {
        *x /= norm;
    }
    true
}

/// Check that a provider returned a vector of the advertised length.
pub fn check_dims(expected: usize, vec: &[f32]) -> Result<(), EmbeddingError> {
    if vec.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vec.len(),
        });
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use knowledge_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}
