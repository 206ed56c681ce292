//! The embedding index: chunk vectors plus exact nearest-neighbour search.
//!
//! # Concurrency
//!
//! Readers clone an `Arc` to the current immutable [`Snapshot`] and score
//! it on the blocking pool, so searches never wait on each other. Writers
//! take a single async writer lock, embed, persist through the
//! [`IndexStore`], and only then swap the new snapshot in. A search sees
//! either the old snapshot or the new one, never a mix.
//!
//! # Health
//!
//! If persisted state fails validation (bad vector blob, dimension or model
//! mismatch, invalid offsets) the index turns [`IndexHealth::Unhealthy`].
//! While unhealthy every write fails with [`RagError::IndexCorrupted`] and
//! searches keep using the last snapshot that loaded cleanly. Only
//! [`EmbeddingIndex::reset`] clears the condition.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::embedding::{self, cosine_similarity, dot_product, EmbeddingBackend};
use crate::error::{RagError, Result};
use crate::models::{Chunk, DocumentMetadata, RetrievalResult, RetrievedChunk};
use crate::store::{IndexMeta, IndexStore, PersistedIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    Cosine,
    Dot,
}

impl SimilarityMetric {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "cosine" => Ok(Self::Cosine),
            "dot" => Ok(Self::Dot),
            other => Err(RagError::InvalidConfiguration(format!(
                "unknown similarity metric: {}",
                other
            ))),
        }
    }

    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => cosine_similarity(a, b),
            Self::Dot => dot_product(a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum IndexHealth {
    Healthy,
    Unhealthy(String),
}

impl IndexHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, IndexHealth::Healthy)
    }
}

/// Immutable view of the index at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Sorted by `chunk_id`.
    chunks: Vec<Chunk>,
    documents: BTreeMap<String, DocumentMetadata>,
}

impl Snapshot {
    fn from_parts(documents: BTreeMap<String, DocumentMetadata>, chunks: BTreeMap<String, Chunk>) -> Self {
        Self {
            chunks: chunks.into_values().collect(),
            documents,
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn document(&self, source_id: &str) -> Option<&DocumentMetadata> {
        self.documents.get(source_id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentMetadata> {
        self.documents.values()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    fn chunk_map(&self) -> BTreeMap<String, Chunk> {
        self.chunks
            .iter()
            .map(|c| (c.chunk_id.clone(), c.clone()))
            .collect()
    }
}

/// Summary returned by every successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexHandle {
    /// Incremented on every snapshot swap.
    pub generation: u64,
    pub documents: usize,
    pub chunks: usize,
}

/// Result of [`EmbeddingIndex::replace_source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceUpdate {
    Replaced { chunks: usize, handle: IndexHandle },
    /// The index already holds a newer version; nothing was written.
    StaleVersion { current: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub model: String,
    pub dims: usize,
    pub metric: SimilarityMetric,
    pub generation: u64,
    pub health: IndexHealth,
}

pub struct EmbeddingIndex {
    backend: Arc<dyn EmbeddingBackend>,
    store: Arc<dyn IndexStore>,
    metric: SimilarityMetric,
    batch_size: usize,
    snapshot: RwLock<Arc<Snapshot>>,
    health: RwLock<IndexHealth>,
    writer: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl EmbeddingIndex {
    /// Open the index over `store`, loading whatever it holds.
    ///
    /// Corrupt persisted state does not fail the open: the index starts
    /// unhealthy and empty. Storage I/O errors do fail it.
    pub async fn open(
        backend: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn IndexStore>,
        metric: SimilarityMetric,
        batch_size: usize,
    ) -> Result<Self> {
        let index = Self {
            backend,
            store,
            metric,
            batch_size: batch_size.max(1),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            health: RwLock::new(IndexHealth::Healthy),
            writer: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        };
        index.reload().await?;
        Ok(index)
    }

    /// Reload from the store. On corruption the current snapshot is kept
    /// and the index is marked unhealthy.
    pub async fn reload(&self) -> Result<IndexHealth> {
        let _writer = self.writer.lock().await;
        let loaded = self.store.load().await.and_then(|p| self.validate(p));
        match loaded {
            Ok(snapshot) => {
                tracing::info!(
                    documents = snapshot.document_count(),
                    chunks = snapshot.chunk_count(),
                    "index loaded"
                );
                self.swap(snapshot);
                Ok(self.health())
            }
            Err(RagError::IndexCorrupted(reason)) => {
                tracing::error!(reason = %reason, "index corrupted; writes disabled, serving last good snapshot");
                self.set_health(IndexHealth::Unhealthy(reason));
                Ok(self.health())
            }
            Err(e) => Err(e),
        }
    }

    fn validate(&self, persisted: PersistedIndex) -> Result<Snapshot> {
        let expected = self.meta();
        if let Some(meta) = &persisted.meta {
            if meta.dims != expected.dims {
                return Err(RagError::IndexCorrupted(format!(
                    "stored dimension {} does not match configured {}",
                    meta.dims, expected.dims
                )));
            }
            if meta.model != expected.model {
                return Err(RagError::IndexCorrupted(format!(
                    "index was built with model '{}', configured model is '{}'",
                    meta.model, expected.model
                )));
            }
        } else if !persisted.chunks.is_empty() {
            return Err(RagError::IndexCorrupted("chunks stored without index metadata".into()));
        }

        for chunk in &persisted.chunks {
            if chunk.embedding.len() != expected.dims {
                return Err(RagError::IndexCorrupted(format!(
                    "chunk '{}' has {} dimensions, expected {}",
                    chunk.chunk_id,
                    chunk.embedding.len(),
                    expected.dims
                )));
            }
            if chunk.end_offset <= chunk.start_offset {
                return Err(RagError::IndexCorrupted(format!(
                    "chunk '{}' has an empty offset range",
                    chunk.chunk_id
                )));
            }
        }

        Ok(Snapshot::from_parts(
            persisted
                .documents
                .into_iter()
                .map(|d| (d.source_id.clone(), d))
                .collect(),
            persisted
                .chunks
                .into_iter()
                .map(|c| (c.chunk_id.clone(), c))
                .collect(),
        ))
    }

    pub fn backend(&self) -> &Arc<dyn EmbeddingBackend> {
        &self.backend
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    pub fn health(&self) -> IndexHealth {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_health(&self, health: IndexHealth) {
        *self.health.write().unwrap_or_else(PoisonError::into_inner) = health;
    }

    /// The current snapshot. Holding it pins that version in memory.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, snapshot: Snapshot) -> IndexHandle {
        let documents = snapshot.document_count();
        let chunks = snapshot.chunk_count();
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        IndexHandle {
            generation,
            documents,
            chunks,
        }
    }

    fn meta(&self) -> IndexMeta {
        IndexMeta {
            model: self.backend.model_name().to_string(),
            dims: self.backend.dims(),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.health() {
            IndexHealth::Healthy => Ok(()),
            IndexHealth::Unhealthy(reason) => Err(RagError::IndexCorrupted(reason)),
        }
    }

    async fn embed_chunks(&self, chunks: &mut [Chunk]) -> Result<()> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedding::embed_batched(&*self.backend, &texts, self.batch_size).await?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.embedding = vector;
        }
        Ok(())
    }

    /// Embed a query string with the index's backend.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        embedding::embed_one(&*self.backend, text).await
    }

    /// Replace the whole index with `chunks`.
    ///
    /// Every chunk is embedded before anything is written. If the backend
    /// fails the build aborts and the previous index stays in place.
    pub async fn build(
        &self,
        documents: Vec<DocumentMetadata>,
        mut chunks: Vec<Chunk>,
    ) -> Result<IndexHandle> {
        let _writer = self.writer.lock().await;
        self.ensure_writable()?;

        let mut by_source: BTreeMap<String, DocumentMetadata> = BTreeMap::new();
        for d in documents {
            if let Some(existing) = by_source.get(&d.source_id) {
                return Err(RagError::SourceConflict {
                    source_id: d.source_id,
                    existing: existing.origin_path.clone(),
                    incoming: d.origin_path,
                });
            }
            by_source.insert(d.source_id.clone(), d);
        }
        let documents = by_source;

        self.embed_chunks(&mut chunks).await?;
        let chunks: BTreeMap<String, Chunk> = chunks
            .into_iter()
            .map(|c| (c.chunk_id.clone(), c))
            .collect();
        let snapshot = Snapshot::from_parts(documents, chunks);

        self.store
            .replace_all(
                &snapshot.documents.values().cloned().collect::<Vec<_>>(),
                &snapshot.chunks,
                &self.meta(),
            )
            .await?;

        let handle = self.swap(snapshot);
        tracing::info!(
            documents = handle.documents,
            chunks = handle.chunks,
            generation = handle.generation,
            "index rebuilt"
        );
        Ok(handle)
    }

    /// Atomically replace every chunk of `document.source_id`.
    ///
    /// A document whose version is lower than the stored one is not written.
    /// A source stored from a different origin path is refused with
    /// [`RagError::SourceConflict`].
    pub async fn replace_source(
        &self,
        document: DocumentMetadata,
        mut chunks: Vec<Chunk>,
    ) -> Result<SourceUpdate> {
        let _writer = self.writer.lock().await;
        self.ensure_writable()?;

        let current = self.snapshot();
        if let Some(existing) = current.document(&document.source_id) {
            if existing.origin_path != document.origin_path {
                return Err(RagError::SourceConflict {
                    source_id: document.source_id,
                    existing: existing.origin_path.clone(),
                    incoming: document.origin_path,
                });
            }
            if existing.version > document.version {
                return Ok(SourceUpdate::StaleVersion {
                    current: existing.version,
                });
            }
        }

        self.embed_chunks(&mut chunks).await?;
        self.store
            .replace_source(&document, &chunks, &self.meta())
            .await?;

        let mut chunk_map = current.chunk_map();
        chunk_map.retain(|_, c| c.source_id != document.source_id);
        let count = chunks.len();
        for c in chunks {
            chunk_map.insert(c.chunk_id.clone(), c);
        }
        let mut documents = current.documents.clone();
        documents.insert(document.source_id.clone(), document);

        let handle = self.swap(Snapshot::from_parts(documents, chunk_map));
        Ok(SourceUpdate::Replaced {
            chunks: count,
            handle,
        })
    }

    /// Add or replace one chunk without a rebuild.
    pub async fn upsert(&self, mut chunk: Chunk) -> Result<IndexHandle> {
        let _writer = self.writer.lock().await;
        self.ensure_writable()?;
        if chunk.end_offset <= chunk.start_offset {
            return Err(RagError::Internal(format!(
                "chunk '{}' has an empty offset range",
                chunk.chunk_id
            )));
        }

        chunk.embedding = embedding::embed_one(&*self.backend, &chunk.text).await?;
        self.store.upsert_chunk(&chunk, &self.meta()).await?;

        let current = self.snapshot();
        let mut chunk_map = current.chunk_map();
        chunk_map.insert(chunk.chunk_id.clone(), chunk);
        Ok(self.swap(Snapshot::from_parts(current.documents.clone(), chunk_map)))
    }

    /// Drop all persisted state and clear an unhealthy condition.
    pub async fn reset(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.store.clear().await?;
        self.swap(Snapshot::default());
        self.set_health(IndexHealth::Healthy);
        tracing::warn!("index reset");
        Ok(())
    }

    /// Exact nearest-neighbour search over the current snapshot.
    ///
    /// Results are ordered by score descending, then `chunk_id` ascending.
    /// Fails with [`RagError::EmptyIndex`] when there is nothing to search.
    pub async fn search(&self, query_embedding: &[f32], k: usize) -> Result<RetrievalResult> {
        let snapshot = self.snapshot();
        if snapshot.chunks.is_empty() {
            return Err(RagError::EmptyIndex);
        }
        if query_embedding.len() != self.dims() {
            return Err(RagError::EmbeddingBackend(format!(
                "query vector has {} dimensions, index expects {}",
                query_embedding.len(),
                self.dims()
            )));
        }

        let query = query_embedding.to_vec();
        let metric = self.metric;
        tokio::task::spawn_blocking(move || rank(&snapshot, &query, k, metric))
            .await
            .map_err(|e| RagError::Internal(format!("search task failed: {}", e)))
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            documents: snapshot.document_count(),
            chunks: snapshot.chunk_count(),
            model: self.backend.model_name().to_string(),
            dims: self.backend.dims(),
            metric: self.metric,
            generation: self.generation.load(Ordering::SeqCst),
            health: self.health(),
        }
    }
}

fn rank(snapshot: &Snapshot, query: &[f32], k: usize, metric: SimilarityMetric) -> RetrievalResult {
    let mut scored: Vec<(f32, &Chunk)> = snapshot
        .chunks
        .iter()
        .map(|c| (metric.score(query, &c.embedding), c))
        .filter(|(score, _)| score.is_finite())
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
    });
    scored.truncate(k);

    RetrievalResult::new(
        scored
            .into_iter()
            .map(|(score, c)| RetrievedChunk {
                chunk_id: c.chunk_id.clone(),
                source_id: c.source_id.clone(),
                similarity_score: score,
                text: c.text.clone(),
            })
            .collect(),
    )
}
