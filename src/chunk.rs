//! Fixed-window text chunker with overlap.
//!
//! Splits a [`Document`] into [`Chunk`]s of at most `chunk_size` characters.
//! Consecutive chunk starts advance by exactly `chunk_size - chunk_overlap`,
//! so the chunks cover the whole document with no gaps and overlap only at
//! declared boundaries. Offsets count Unicode scalar values, never bytes, so
//! a chunk never splits a multi-byte character.
//!
//! Each chunk receives a deterministic id derived from its document's
//! `source_id` and index, plus a SHA-256 hash of its text.
//!
//! # Example
//!
//! ```rust
//! use sentinel_rag::chunk::DocumentProcessor;
//! use sentinel_rag::config::ChunkingConfig;
//! use sentinel_rag::models::{Document, DocumentMetadata};
//!
//! let processor = DocumentProcessor::new(&ChunkingConfig { chunk_size: 300, chunk_overlap: 50 }).unwrap();
//! let doc = Document::new(
//!     DocumentMetadata {
//!         source_id: "pojk-42-2020".into(),
//!         version: 1,
//!         effective_date: None,
//!         origin_path: "pojk-42-2020.txt".into(),
//!         title: None,
//!         trusted: true,
//!     },
//!     "x".repeat(1000),
//! );
//! let starts: Vec<usize> = processor.chunk(&doc).iter().map(|c| c.start_offset).collect();
//! assert_eq!(starts, vec![0, 250, 500, 750]);
//! ```

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Document};

/// Splits documents into overlapping chunks. Holds only validated settings.
#[derive(Debug, Clone)]
pub struct DocumentProcessor {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentProcessor {
    /// Fails with [`RagError::InvalidConfiguration`] unless
    /// `chunk_size > 0` and `chunk_overlap < chunk_size`.
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(RagError::InvalidConfiguration(
                "chunking.chunk_size must be > 0".to_string(),
            ));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(RagError::InvalidConfiguration(format!(
                "chunking.chunk_overlap ({}) must be < chunk_size ({})",
                config.chunk_overlap, config.chunk_size
            )));
        }
        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        })
    }

    /// Distance between consecutive chunk starts.
    pub fn stride(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }

    /// Split a document into chunks pending embedding.
    ///
    /// An empty document produces no chunks. The final chunk may be shorter
    /// than `chunk_size` and always ends at the document length.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = document.text.as_str();
        // Byte position of every char, plus the end sentinel.
        let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let char_len = boundaries.len();
        boundaries.push(text.len());

        let mut chunks = Vec::new();
        if char_len == 0 {
            return chunks;
        }

        let mut start = 0usize;
        loop {
            let end = (start + self.chunk_size).min(char_len);
            let span = &text[boundaries[start]..boundaries[end]];
            chunks.push(make_chunk(document.source_id(), chunks.len(), span, start, end));
            if end == char_len {
                break;
            }
            start += self.stride();
        }

        chunks
    }
}

fn make_chunk(source_id: &str, index: usize, text: &str, start: usize, end: usize) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        chunk_id: Chunk::make_id(source_id, index),
        source_id: source_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        start_offset: start,
        end_offset: end,
        hash,
        embedding: Vec::new(),
    }
}
