//! Query-side retrieval: embed, search, threshold.
//!
//! [`RetrievalEngine`] takes only a [`SanitizedQuery`], so unsanitized text
//! cannot reach the embedding backend through this path. Results keep the
//! index's ordering (score descending, `chunk_id` ascending), which makes
//! repeated queries against an unchanged index return identical results.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::index::EmbeddingIndex;
use crate::models::{Query, RetrievalResult, SanitizedQuery};

pub struct RetrievalEngine {
    index: Arc<EmbeddingIndex>,
}

impl RetrievalEngine {
    pub fn new(index: Arc<EmbeddingIndex>) -> Self {
        Self { index }
    }

    /// Embed a sanitized query. `raw_text` is kept on the [`Query`] for
    /// provenance only.
    pub async fn embed(&self, raw_text: &str, sanitized: SanitizedQuery) -> Result<Query> {
        let embedding = self.index.embed_query(sanitized.as_str()).await?;
        Ok(Query {
            raw_text: raw_text.to_string(),
            sanitized,
            embedding,
            issued_at: Utc::now(),
        })
    }

    /// Search with an already embedded query and drop hits below `min_score`.
    ///
    /// Zero surviving hits is an empty result, not an error.
    /// [`RagError::EmptyIndex`](crate::error::RagError::EmptyIndex) still
    /// propagates.
    pub async fn search(&self, query: &Query, k: usize, min_score: f32) -> Result<RetrievalResult> {
        let mut result = self.index.search(&query.embedding, k).await?;
        result.hits.retain(|h| h.similarity_score >= min_score);
        tracing::debug!(
            hits = result.len(),
            top_score = result.top_score().unwrap_or(0.0),
            "retrieval complete"
        );
        Ok(result)
    }

    /// `embed` followed by `search`.
    pub async fn retrieve(
        &self,
        query: &SanitizedQuery,
        k: usize,
        min_score: f32,
    ) -> Result<RetrievalResult> {
        let query = self.embed(query.as_str(), query.clone()).await?;
        self.search(&query, k, min_score).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::DocumentProcessor;
    use crate::config::{ChunkingConfig, SecurityConfig};
    use crate::embedding::HashingBackend;
    use crate::error::RagError;
    use crate::index::SimilarityMetric;
    use crate::models::{Document, DocumentMetadata};
    use crate::security::SecurityGate;
    use crate::store::MemoryStore;

    async fn engine_with(texts: &[(&str, &str)]) -> RetrievalEngine {
        let index = EmbeddingIndex::open(
            Arc::new(HashingBackend::new(384)),
            Arc::new(MemoryStore::new()),
            SimilarityMetric::Cosine,
            16,
        )
        .await
        .unwrap();
        let processor = DocumentProcessor::new(&ChunkingConfig::default()).unwrap();
        let mut docs = Vec::new();
        let mut chunks = Vec::new();
        for (source_id, text) in texts {
            let doc = Document::new(
                DocumentMetadata {
                    source_id: source_id.to_string(),
                    version: 1,
                    effective_date: None,
                    origin_path: format!("{}.txt", source_id),
                    title: None,
                    trusted: true,
                },
                *text,
            );
            chunks.extend(processor.chunk(&doc));
            docs.push(doc.metadata);
        }
        if !chunks.is_empty() {
            index.build(docs, chunks).await.unwrap();
        }
        RetrievalEngine::new(Arc::new(index))
    }

    fn sanitized(text: &str) -> SanitizedQuery {
        SecurityGate::new(&SecurityConfig::default())
            .unwrap()
            .sanitize(text)
            .unwrap()
    }

    #[tokio::test]
    async fn test_afiliasi_query_scores_above_threshold() {
        let engine = engine_with(&[
            ("pojk-42-2020", "Transaksi afiliasi: apa itu transaksi afiliasi menurut POJK."),
            ("pojk-11-2022", "Penyelenggaraan teknologi informasi oleh bank umum wajib memiliki rencana pemulihan bencana."),
        ])
        .await;
        let result = engine
            .retrieve(&sanitized("Apa itu transaksi afiliasi?"), 5, 0.0)
            .await
            .unwrap();
        assert_eq!(result.hits[0].source_id, "pojk-42-2020");
        assert!(result.top_score().unwrap() > 0.5);
    }

    #[tokio::test]
    async fn test_retrieve_is_idempotent() {
        let engine = engine_with(&[
            ("a", "modal inti bank minimum tiga triliun rupiah"),
            ("b", "modal inti dan modal pelengkap bank"),
            ("c", "laporan keuangan publikasi triwulanan"),
        ])
        .await;
        let q = sanitized("modal inti bank");
        let first = engine.retrieve(&q, 3, 0.0).await.unwrap();
        let second = engine.retrieve(&q, 3, 0.0).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_min_score_filters_without_error() {
        let engine = engine_with(&[("a", "laporan keuangan publikasi triwulanan")]).await;
        let result = engine
            .retrieve(&sanitized("transaksi afiliasi"), 5, 0.99)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_empty_index_propagates() {
        let engine = engine_with(&[]).await;
        let err = engine.retrieve(&sanitized("apa saja"), 5, 0.0).await.unwrap_err();
        assert!(matches!(err, RagError::EmptyIndex));
    }
}
