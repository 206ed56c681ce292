//! Persistence for the embedding index.
//!
//! The [`IndexStore`] trait covers what the index needs from storage:
//! load everything at startup, replace everything on rebuild, replace one
//! source on re-ingestion, and upsert a single chunk. Every write is atomic
//! so a restart never observes a half-written index.
//!
//! | Implementation | Backing | Atomicity |
//! |----------------|---------|-----------|
//! | [`SqliteStore`] | SQLite via sqlx (WAL) | one transaction per write |
//! | [`MemoryStore`] | `RwLock` over plain collections | one write lock per write |
//!
//! # Schema
//!
//! ```text
//! documents(source_id PK, version, effective_date, origin_path, title, trusted, ingested_at)
//! chunks(chunk_id PK, source_id, chunk_index, text, start_offset, end_offset, hash, embedding BLOB)
//! index_meta(key PK, value)      -- embedding model and dimension
//! ```

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::config::DbConfig;
use crate::embedding::{try_blob_to_vec, vec_to_blob};
use crate::error::{RagError, Result};
use crate::models::{Chunk, DocumentMetadata};

/// Embedding model and dimension the stored vectors were produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub model: String,
    pub dims: usize,
}

/// Everything persisted, as loaded at startup.
#[derive(Debug, Default)]
pub struct PersistedIndex {
    pub documents: Vec<DocumentMetadata>,
    /// Chunks with their embeddings populated, ordered by `chunk_id`.
    pub chunks: Vec<Chunk>,
    pub meta: Option<IndexMeta>,
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Load the full index. Malformed rows are reported as
    /// [`RagError::IndexCorrupted`].
    async fn load(&self) -> Result<PersistedIndex>;

    /// Atomically replace the whole index.
    async fn replace_all(
        &self,
        documents: &[DocumentMetadata],
        chunks: &[Chunk],
        meta: &IndexMeta,
    ) -> Result<()>;

    /// Atomically replace one document and all of its chunks.
    async fn replace_source(
        &self,
        document: &DocumentMetadata,
        chunks: &[Chunk],
        meta: &IndexMeta,
    ) -> Result<()>;

    /// Insert or replace a single chunk.
    async fn upsert_chunk(&self, chunk: &Chunk, meta: &IndexMeta) -> Result<()>;

    /// Remove everything, including index metadata.
    async fn clear(&self) -> Result<()>;
}

/// Open the store configured in `[db]`.
pub async fn open_store(config: &DbConfig) -> Result<Arc<dyn IndexStore>> {
    if config.is_in_memory() {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(SqliteStore::connect(config).await?))
    }
}

fn corrupted(what: impl Into<String>) -> RagError {
    RagError::IndexCorrupted(what.into())
}

// ============ SQLite ============

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the file if needed) and run migrations.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let db_path = &config.path;
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                source_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                effective_date TEXT,
                origin_path TEXT NOT NULL,
                title TEXT,
                trusted INTEGER NOT NULL,
                ingested_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                hash TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn insert_document(
        tx: &mut Transaction<'_, Sqlite>,
        doc: &DocumentMetadata,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (source_id, version, effective_date, origin_path, title, trusted, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                version = excluded.version,
                effective_date = excluded.effective_date,
                origin_path = excluded.origin_path,
                title = excluded.title,
                trusted = excluded.trusted,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&doc.source_id)
        .bind(doc.version as i64)
        .bind(doc.effective_date.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(&doc.origin_path)
        .bind(&doc.title)
        .bind(doc.trusted)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks
                (chunk_id, source_id, chunk_index, text, start_offset, end_offset, hash, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.source_id)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.text)
        .bind(chunk.start_offset as i64)
        .bind(chunk.end_offset as i64)
        .bind(&chunk.hash)
        .bind(vec_to_blob(&chunk.embedding))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_meta(tx: &mut Transaction<'_, Sqlite>, meta: &IndexMeta) -> Result<()> {
        for (key, value) in [("model", meta.model.clone()), ("dims", meta.dims.to_string())] {
            sqlx::query("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

fn to_usize(value: i64, what: &str, id: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| corrupted(format!("{} of '{}' is negative", what, id)))
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn load(&self) -> Result<PersistedIndex> {
        let doc_rows = sqlx::query(
            "SELECT source_id, version, effective_date, origin_path, title, trusted FROM documents ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(doc_rows.len());
        for row in doc_rows {
            let source_id: String = row.try_get("source_id")?;
            let version: i64 = row.try_get("version")?;
            let effective_date = row
                .try_get::<Option<String>, _>("effective_date")?
                .map(|s| {
                    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                        .map_err(|_| corrupted(format!("bad effective_date on '{}'", source_id)))
                })
                .transpose()?;
            documents.push(DocumentMetadata {
                version: u32::try_from(version)
                    .map_err(|_| corrupted(format!("bad version on '{}'", source_id)))?,
                effective_date,
                origin_path: row.try_get("origin_path")?,
                title: row.try_get("title")?,
                trusted: row.try_get("trusted")?,
                source_id,
            });
        }

        let chunk_rows = sqlx::query(
            r#"
            SELECT chunk_id, source_id, chunk_index, text, start_offset, end_offset, hash, embedding
            FROM chunks ORDER BY chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut chunks = Vec::with_capacity(chunk_rows.len());
        for row in chunk_rows {
            let chunk_id: String = row.try_get("chunk_id")?;
            let blob: Vec<u8> = row.try_get("embedding")?;
            let embedding = try_blob_to_vec(&blob)
                .ok_or_else(|| corrupted(format!("malformed vector for chunk '{}'", chunk_id)))?;
            chunks.push(Chunk {
                source_id: row.try_get("source_id")?,
                chunk_index: to_usize(row.try_get("chunk_index")?, "chunk_index", &chunk_id)?,
                text: row.try_get("text")?,
                start_offset: to_usize(row.try_get("start_offset")?, "start_offset", &chunk_id)?,
                end_offset: to_usize(row.try_get("end_offset")?, "end_offset", &chunk_id)?,
                hash: row.try_get("hash")?,
                embedding,
                chunk_id,
            });
        }

        let meta_rows = sqlx::query("SELECT key, value FROM index_meta")
            .fetch_all(&self.pool)
            .await?;
        let mut kv = BTreeMap::new();
        for row in meta_rows {
            kv.insert(row.try_get::<String, _>("key")?, row.try_get::<String, _>("value")?);
        }
        let meta = match (kv.get("model"), kv.get("dims")) {
            (Some(model), Some(dims)) => Some(IndexMeta {
                model: model.clone(),
                dims: dims
                    .parse()
                    .map_err(|_| corrupted(format!("bad stored dimension '{}'", dims)))?,
            }),
            (None, None) => None,
            _ => return Err(corrupted("incomplete index metadata")),
        };

        Ok(PersistedIndex {
            documents,
            chunks,
            meta,
        })
    }

    async fn replace_all(
        &self,
        documents: &[DocumentMetadata],
        chunks: &[Chunk],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        for doc in documents {
            Self::insert_document(&mut tx, doc).await?;
        }
        for chunk in chunks {
            Self::insert_chunk(&mut tx, chunk).await?;
        }
        Self::write_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_source(
        &self,
        document: &DocumentMetadata,
        chunks: &[Chunk],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(&document.source_id)
            .execute(&mut *tx)
            .await?;
        Self::insert_document(&mut tx, document).await?;
        for chunk in chunks {
            Self::insert_chunk(&mut tx, chunk).await?;
        }
        Self::write_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_chunk(&self, chunk: &Chunk, meta: &IndexMeta) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_chunk(&mut tx, chunk).await?;
        Self::write_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM index_meta").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

// ============ In-memory ============

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, DocumentMetadata>,
    chunks: BTreeMap<String, Chunk>,
    meta: Option<IndexMeta>,
}

/// Process-local store used with `db.path = ":memory:"` and in tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| corrupted("memory store lock poisoned"))
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn load(&self) -> Result<PersistedIndex> {
        let state = self
            .state
            .read()
            .map_err(|_| corrupted("memory store lock poisoned"))?;
        Ok(PersistedIndex {
            documents: state.documents.values().cloned().collect(),
            chunks: state.chunks.values().cloned().collect(),
            meta: state.meta.clone(),
        })
    }

    async fn replace_all(
        &self,
        documents: &[DocumentMetadata],
        chunks: &[Chunk],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut state = self.write()?;
        state.documents = documents
            .iter()
            .map(|d| (d.source_id.clone(), d.clone()))
            .collect();
        state.chunks = chunks
            .iter()
            .map(|c| (c.chunk_id.clone(), c.clone()))
            .collect();
        state.meta = Some(meta.clone());
        Ok(())
    }

    async fn replace_source(
        &self,
        document: &DocumentMetadata,
        chunks: &[Chunk],
        meta: &IndexMeta,
    ) -> Result<()> {
        let mut state = self.write()?;
        state.chunks.retain(|_, c| c.source_id != document.source_id);
        for c in chunks {
            state.chunks.insert(c.chunk_id.clone(), c.clone());
        }
        state
            .documents
            .insert(document.source_id.clone(), document.clone());
        state.meta = Some(meta.clone());
        Ok(())
    }

    async fn upsert_chunk(&self, chunk: &Chunk, meta: &IndexMeta) -> Result<()> {
        let mut state = self.write()?;
        state.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        state.meta = Some(meta.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.write()? = MemoryState::default();
        Ok(())
    }
}
