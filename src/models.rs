//! Core data models used throughout the pipeline.
//!
//! These types represent the documents, chunks, queries, retrieval results,
//! and answers that flow through ingestion and query handling.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{RagError, Result};

/// Provenance and versioning metadata attached to a [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    /// Stable identifier of the regulation or source (e.g. `"pojk-30-2016"`).
    pub source_id: String,
    /// Monotonic version; a higher version supersedes a lower one.
    pub version: u32,
    pub effective_date: Option<NaiveDate>,
    /// Path relative to the corpus root the document was read from.
    pub origin_path: String,
    pub title: Option<String>,
    /// Content from untrusted feeds is run through the security deny-list.
    pub trusted: bool,
}

/// Immutable source document. A changed document is ingested as a new
/// version rather than edited in place.
#[derive(Debug, Clone)]
pub struct Document {
    pub metadata: DocumentMetadata,
    pub text: String,
}

impl Document {
    pub fn new(metadata: DocumentMetadata, text: impl Into<String>) -> Self {
        Self {
            metadata,
            text: text.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.metadata.source_id
    }

    /// Length in Unicode scalar values, the unit chunk offsets are expressed in.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A contiguous span of a document, the atomic unit of retrieval.
///
/// `text` is exactly the characters `[start_offset, end_offset)` of the
/// source document. `embedding` is empty until the index embeds the chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

impl Chunk {
    /// Deterministic chunk id: lexical order matches document order.
    pub fn make_id(source_id: &str, chunk_index: usize) -> String {
        format!("{}#{:04}", source_id, chunk_index)
    }

    pub fn is_embedded(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Query text that has passed the security gate.
///
/// Only [`SecurityGate::sanitize`](crate::security::SecurityGate::sanitize)
/// can construct one, so retrieval and composition never see raw input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedQuery(String);

impl SanitizedQuery {
    pub(crate) fn new(text: String) -> Self {
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SanitizedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single in-flight query. Created and discarded per request.
#[derive(Debug, Clone)]
pub struct Query {
    pub raw_text: String,
    pub sanitized: SanitizedQuery,
    pub embedding: Vec<f32>,
    pub issued_at: DateTime<Utc>,
}

/// Point in time by which a request must finish. Checked between stages.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Fail with [`RagError::DeadlineExceeded`] naming `stage` once expired.
    pub fn check(&self, stage: &'static str) -> Result<()> {
        if self.is_expired() {
            Err(RagError::DeadlineExceeded(stage))
        } else {
            Ok(())
        }
    }
}

/// One ranked retrieval hit.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub source_id: String,
    pub similarity_score: f32,
    /// Chunk text, carried so the composer never has to reach back into the index.
    #[serde(skip)]
    pub text: String,
}

/// Ordered retrieval hits: score descending, ties broken by lower `chunk_id`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    pub fn new(hits: Vec<RetrievedChunk>) -> Self {
        Self { hits }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn top_score(&self) -> Option<f32> {
        self.hits.first().map(|h| h.similarity_score)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.hits.iter().any(|h| h.chunk_id == chunk_id)
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }
}

/// Why an answer could not be grounded through the normal path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    BackendTimeout,
    BackendError,
    NoContext,
}

/// Fixed answer text used when the generation backend is unavailable.
pub const ANALYSIS_UNAVAILABLE: &str = "analysis unavailable";

/// Fixed answer text used when retrieval found nothing to ground on.
pub const NO_RELEVANT_PASSAGES: &str = "no relevant passages found";

/// A generated answer.
///
/// Fields are private so the grounding invariant holds by construction:
/// `grounded == !citations.is_empty()`, and confidence is `0.0` whenever
/// there are no citations.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Answer {
    text: String,
    citations: Vec<String>,
    confidence_score: f64,
    grounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<DegradeReason>,
    /// Cap on the generation call that timed out.
    #[serde(skip)]
    timeout_budget_ms: Option<u64>,
}

impl Answer {
    pub fn new(text: impl Into<String>, citations: Vec<String>, confidence: f64) -> Self {
        let grounded = !citations.is_empty();
        let confidence_score = if grounded {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            text: text.into(),
            citations,
            confidence_score,
            grounded,
            degraded: None,
            timeout_budget_ms: None,
        }
    }

    pub fn degraded(reason: DegradeReason) -> Self {
        let text = match reason {
            DegradeReason::NoContext => NO_RELEVANT_PASSAGES,
            DegradeReason::BackendTimeout | DegradeReason::BackendError => ANALYSIS_UNAVAILABLE,
        };
        Self {
            text: text.to_string(),
            citations: Vec::new(),
            confidence_score: 0.0,
            grounded: false,
            degraded: Some(reason),
            timeout_budget_ms: None,
        }
    }

    /// Degraded answer for a generation call cut off after `budget`.
    pub fn timed_out(budget: Duration) -> Self {
        Self {
            timeout_budget_ms: Some(budget.as_millis() as u64),
            ..Self::degraded(DegradeReason::BackendTimeout)
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn citations(&self) -> &[String] {
        &self.citations
    }

    pub fn confidence_score(&self) -> f64 {
        self.confidence_score
    }

    pub fn grounded(&self) -> bool {
        self.grounded
    }

    pub fn degraded_reason(&self) -> Option<DegradeReason> {
        self.degraded
    }

    pub fn timeout_budget_ms(&self) -> Option<u64> {
        self.timeout_budget_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_without_citations_is_ungrounded() {
        let a = Answer::new("text", Vec::new(), 0.9);
        assert!(!a.grounded());
        assert_eq!(a.confidence_score(), 0.0);
    }

    #[test]
    fn test_answer_confidence_clamped() {
        let a = Answer::new("text", vec!["a#0000".into()], 1.7);
        assert!(a.grounded());
        assert_eq!(a.confidence_score(), 1.0);
    }

    #[test]
    fn test_degraded_answer_shape() {
        let a = Answer::degraded(DegradeReason::BackendTimeout);
        assert_eq!(a.text(), ANALYSIS_UNAVAILABLE);
        assert!(!a.grounded());
        assert_eq!(a.confidence_score(), 0.0);
        assert_eq!(a.degraded_reason(), Some(DegradeReason::BackendTimeout));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(10));
        assert!(deadline.check("sanitizing").is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            deadline.check("retrieving"),
            Err(RagError::DeadlineExceeded("retrieving"))
        ));
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_chunk_ids_sort_in_document_order() {
        let mut ids: Vec<String> = [10, 2, 0, 1].iter().map(|i| Chunk::make_id("doc", *i)).collect();
        ids.sort();
        assert_eq!(ids, vec!["doc#0000", "doc#0001", "doc#0002", "doc#0010"]);
    }
}
