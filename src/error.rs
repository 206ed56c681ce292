//! Error taxonomy for the RAG pipeline.
//!
//! Every failure that can reach a caller is a [`RagError`] variant. Each
//! variant belongs to one [`ErrorClass`] and carries a stable machine code
//! (see [`RagError::code`]) used by the HTTP layer and the CLI.
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Input rejection | `InjectionDetected`, `PathTraversal`, `InvalidQuery`, `SourceConflict` | returned immediately, never retried |
//! | Resource | `EmptyIndex`, `EmbeddingBackend`, `Backpressure` | no-answer response, process keeps running |
//! | Transient | `BackendTimeout`, `DeadlineExceeded` | retried once if budget allows, else degraded |
//! | Fatal | `IndexCorrupted` | writes refused, reads served from last good snapshot |
//! | Internal | `InvalidConfiguration`, `Storage`, `Io`, `Extraction`, `Internal` | reported as `internal` or configuration errors |

use thiserror::Error;

/// Coarse classification of a [`RagError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InputRejection,
    Resource,
    Transient,
    Fatal,
    Internal,
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Query or document content matched a deny-list rule. The payload is
    /// the rule name, never the offending text.
    #[error("input rejected by security gate (rule: {rule})")]
    InjectionDetected { rule: String },

    #[error("path rejected: {0}")]
    PathTraversal(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Two different corpus files map to the same source id.
    #[error("source '{source_id}' already belongs to '{existing}', refusing '{incoming}'")]
    SourceConflict {
        source_id: String,
        existing: String,
        incoming: String,
    },

    #[error("index is empty; ingest documents before querying")]
    EmptyIndex,

    #[error("embedding backend error: {0}")]
    EmbeddingBackend(String),

    #[error("generation backend timed out after {0} ms")]
    BackendTimeout(u64),

    #[error("generation backend error: {0}")]
    GenerationBackend(String),

    #[error("generation capacity exhausted; retry later")]
    Backpressure,

    #[error("request deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RagError::InjectionDetected { .. }
            | RagError::PathTraversal(_)
            | RagError::InvalidQuery(_)
            | RagError::SourceConflict { .. } => ErrorClass::InputRejection,
            RagError::EmptyIndex
            | RagError::EmbeddingBackend(_)
            | RagError::GenerationBackend(_)
            | RagError::Backpressure => ErrorClass::Resource,
            RagError::BackendTimeout(_) | RagError::DeadlineExceeded(_) => ErrorClass::Transient,
            RagError::IndexCorrupted(_) => ErrorClass::Fatal,
            RagError::InvalidConfiguration(_)
            | RagError::Storage(_)
            | RagError::Io(_)
            | RagError::Extraction(_)
            | RagError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::InvalidConfiguration(_) => "invalid_configuration",
            RagError::InjectionDetected { .. } => "injection_detected",
            RagError::PathTraversal(_) => "path_traversal",
            RagError::InvalidQuery(_) => "invalid_query",
            RagError::SourceConflict { .. } => "source_conflict",
            RagError::EmptyIndex => "empty_index",
            RagError::EmbeddingBackend(_) => "embedding_backend_error",
            RagError::BackendTimeout(_) => "backend_timeout",
            RagError::GenerationBackend(_) => "generation_backend_error",
            RagError::Backpressure => "backpressure",
            RagError::DeadlineExceeded(_) => "deadline_exceeded",
            RagError::IndexCorrupted(_) => "index_corrupted",
            RagError::Storage(_) => "storage_error",
            RagError::Io(_) => "io_error",
            RagError::Extraction(_) => "extraction_error",
            RagError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
