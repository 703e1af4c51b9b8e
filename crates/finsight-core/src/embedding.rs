//! Embedding collaborator contract and vector helpers.
//!
//! The [`Embedder`] trait is the only thing the core needs from an
//! embedding service: turn texts into fixed-width dense vectors. It is used
//! per chunk at ingestion and per augmented query at retrieval time.
//! Concrete HTTP providers live in the application crate; [`HashingEmbedder`]
//! is a deterministic offline provider used by tests and the `local` setting.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::CollaboratorError;
use crate::keyword::tokenize;

/// A service that maps text to dense vectors of a fixed width.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;

    /// Width of every returned vector.
    fn dims(&self) -> usize;

    /// Embed `texts`, returning one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError>;
}

/// Embed a single query string.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, CollaboratorError> {
    let mut vectors = embedder.embed(&[text.to_string()]).await?;
    let vector = vectors
        .pop()
        .ok_or_else(|| CollaboratorError::malformed("embedding", "no vector returned"))?;
    if vector.len() != embedder.dims() {
        return Err(CollaboratorError::malformed(
            "embedding",
            format!("expected {} dims, got {}", embedder.dims(), vector.len()),
        ));
    }
    Ok(vector)
}

/// Feature-hashing bag-of-words embedder.
///
/// Each keyword token is hashed into one of `dims` buckets with a sign bit,
/// and the result is L2-normalised. Texts sharing vocabulary land close
/// together, which is enough for offline runs and reproducible tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(word);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing-bow"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Encode a vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing partial words are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|w| f32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty, zero, or
/// mismatched-width vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        dot / denom
    }
}
