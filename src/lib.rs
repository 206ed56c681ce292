//! # Sentinel RAG
//!
//! Citation-grounded retrieval-augmented generation over a corpus of
//! regulatory documents.
//!
//! Documents under one corpus root are chunked, embedded and stored in
//! SQLite. A question is sanitized, embedded, matched against the chunks,
//! and answered by a generation backend that must cite the chunks it used.
//! Citations that do not refer to a retrieved chunk are removed before the
//! answer leaves the pipeline.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!  question ────▶ │ SecurityGate │ ──reject──▶ error
//!                 └──────┬───────┘
//!                        ▼
//!  corpus ─▶ DocumentProcessor ─▶ EmbeddingIndex ◀─▶ IndexStore (SQLite)
//!                        │
//!                        ▼
//!                 RetrievalEngine ─▶ AnswerComposer ─▶ Answer + citations
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`security`] | Query sanitization and path validation |
//! | [`extract`] | Text extraction from corpus files |
//! | [`corpus`] | Corpus directory walking |
//! | [`chunk`] | Overlapping chunking with offsets |
//! | [`embedding`] | Embedding backend abstraction |
//! | [`store`] | Index persistence |
//! | [`index`] | In-memory vector index over a store |
//! | [`retrieval`] | Query embedding and ranked retrieval |
//! | [`generation`] | Generation backend abstraction |
//! | [`composer`] | Prompting, citation validation, degradation |
//! | [`pipeline`] | Ingestion and query orchestration |
//! | [`eval`] | Retrieval precision@k |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//! | [`logging`] | Tracing subscriber setup |

pub mod chunk;
pub mod commands;
pub mod composer;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod extract;
pub mod generation;
pub mod index;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod security;
pub mod server;
pub mod store;
