//! Feature-hashing embedding backend.
//!
//! Each lowercase alphanumeric token is hashed with SHA-256 into one of
//! `dims` buckets with a ±1 sign, counts are summed, and the result is
//! L2-normalized. Identical input always produces the identical vector,
//! which makes this backend the default for offline use and for tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingBackend;
use crate::error::Result;

pub struct HashingBackend {
    dims: usize,
    name: String,
}

impl HashingBackend {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            name: format!("hashing-{}", dims.max(1)),
        }
    }

    /// Embed one text synchronously. Empty or token-free text maps to the
    /// zero vector.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(head) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

#[async_trait]
impl EmbeddingBackend for HashingBackend {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn test_deterministic() {
        let b = HashingBackend::new(64);
        assert_eq!(b.embed_text("Pasal 3 ayat 1"), b.embed_text("Pasal 3 ayat 1"));
    }

    #[test]
    fn test_unit_norm() {
        let v = HashingBackend::new(384).embed_text("transaksi afiliasi benturan kepentingan");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let v = HashingBackend::new(16).embed_text("  ?! ");
        assert_eq!(v.len(), 16);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let b = HashingBackend::new(128);
        assert_eq!(b.embed_text("Transaksi, AFILIASI!"), b.embed_text("transaksi afiliasi"));
    }

    #[test]
    fn test_related_text_scores_high() {
        let b = HashingBackend::new(384);
        let chunk = b.embed_text("Transaksi afiliasi: apa itu transaksi afiliasi menurut POJK.");
        let query = b.embed_text("Apa itu transaksi afiliasi?");
        let unrelated = b.embed_text("Laporan keuangan tahunan wajib diaudit");
        assert!(cosine_similarity(&chunk, &query) > 0.5);
        assert!(cosine_similarity(&chunk, &query) > cosine_similarity(&unrelated, &query));
    }
}
