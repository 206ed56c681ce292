//! Embedding backend abstraction and implementations.
//!
//! Defines the [`EmbeddingBackend`] capability trait and its variants:
//! - **[`HashingBackend`]**: deterministic feature-hashing bag of words; offline, no model.
//! - **[`OllamaBackend`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAiBackend`]**: calls the OpenAI embeddings API.
//! - **`FastEmbedBackend`**: in-process ONNX inference (feature `local-embeddings-fastembed`).
//!
//! Also provides vector utilities used by the index and its persistence:
//! - [`cosine_similarity`] and [`dot_product`]
//! - [`vec_to_blob`] / [`try_blob_to_vec`]: little-endian `f32` BLOB encoding
//!
//! # Backend Selection
//!
//! [`create_backend`] is the only place that inspects `embedding.provider`:
//!
//! ```rust
//! # use sentinel_rag::config::EmbeddingConfig;
//! # use sentinel_rag::embedding::create_backend;
//! let config = EmbeddingConfig::default(); // provider = "hashing"
//! let backend = create_backend(&config).unwrap();
//! assert_eq!(backend.dims(), 384);
//! ```
//!
//! # Retry Strategy
//!
//! The HTTP backends use exponential backoff for transient errors:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, … (capped at 2^5)

mod hashing;
#[cfg(feature = "local-embeddings-fastembed")]
mod local;
pub(crate) mod remote;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};

pub use hashing::HashingBackend;
#[cfg(feature = "local-embeddings-fastembed")]
pub use local::FastEmbedBackend;
pub use remote::{OllamaBackend, OpenAiBackend};

/// Capability interface every embedding backend implements.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Dimensionality of every vector this backend returns.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    ///
    /// Any failure is an [`RagError::EmbeddingBackend`].
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(backend: &dyn EmbeddingBackend, text: &str) -> Result<Vec<f32>> {
    let mut vectors = backend.embed(&[text.to_string()]).await?;
    let vector = vectors
        .pop()
        .ok_or_else(|| RagError::EmbeddingBackend("empty embedding response".to_string()))?;
    check_dims(backend, &vector)?;
    Ok(vector)
}

/// Embed texts in batches of `batch_size`, validating every vector's
/// dimensionality. Fails on the first backend error.
pub async fn embed_batched(
    backend: &dyn EmbeddingBackend,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = backend.embed(batch).await?;
        if vectors.len() != batch.len() {
            return Err(RagError::EmbeddingBackend(format!(
                "backend returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        for v in &vectors {
            check_dims(backend, v)?;
        }
        out.extend(vectors);
    }
    Ok(out)
}

fn check_dims(backend: &dyn EmbeddingBackend, vector: &[f32]) -> Result<()> {
    if vector.len() != backend.dims() {
        return Err(RagError::EmbeddingBackend(format!(
            "model '{}' returned {} dimensions, expected {}",
            backend.model_name(),
            vector.len(),
            backend.dims()
        )));
    }
    Ok(())
}

/// Create the configured [`EmbeddingBackend`].
///
/// | Config Value | Backend |
/// |-------------|---------|
/// | `"hashing"` | [`HashingBackend`] |
/// | `"ollama"` | [`OllamaBackend`] |
/// | `"openai"` | [`OpenAiBackend`] |
/// | `"fastembed"` | `FastEmbedBackend` (feature-gated) |
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingBackend::new(config.dims))),
        "ollama" => Ok(Arc::new(OllamaBackend::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiBackend::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "fastembed" => Ok(Arc::new(FastEmbedBackend::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "fastembed" => Err(RagError::InvalidConfiguration(
            "the fastembed provider requires --features local-embeddings-fastembed".to_string(),
        )),
        other => Err(RagError::InvalidConfiguration(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use sentinel_rag::embedding::{vec_to_blob, try_blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(try_blob_to_vec(&blob), Some(v));
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Returns `None` when the length
/// is not a multiple of 4 or a value is not finite.
pub fn try_blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    let vec: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if vec.iter().all(|v| v.is_finite()) {
        Some(vec)
    } else {
        None
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, or zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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

    dot / denom
}

/// Plain dot product; `0.0` for mismatched lengths.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
