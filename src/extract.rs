//! Plain-text extraction for corpus files.
//!
//! Content type is decided from the file extension of the origin path.
//! Text formats must be valid UTF-8 (a leading BOM is dropped); PDFs go
//! through `pdf-extract`. Extraction never panics: failures are
//! [`RagError::Extraction`] and the ingestion of that file is skipped.

use crate::error::{RagError, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";

/// Content type for an origin path, or `None` when unsupported.
pub fn content_type_for(origin_path: &str) -> Option<&'static str> {
    let ext = origin_path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "txt" | "text" => Some(MIME_TEXT),
        "md" | "markdown" => Some(MIME_MARKDOWN),
        _ => None,
    }
}

/// Extract plain UTF-8 text from `bytes`.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_TEXT | MIME_MARKDOWN => extract_utf8(bytes),
        other => Err(RagError::Extraction(format!("unsupported content-type: {}", other))),
    }
}

fn extract_utf8(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| RagError::Extraction(format!("file is not valid UTF-8: {}", e)))
}

fn extract_pdf(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::Extraction(format!("PDF extraction failed: {}", e)))
}
