//! SQLite-backed RAG store implementation.
//!
//! Passages and their embeddings live in a single table scoped by
//! collection name. Search is brute-force cosine similarity over the
//! collection's rows.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::store::{rank, RagStore};
use super::types::{Metadata, Passage, ScoredPassage};
use crate::core::errors::RagError;
use crate::vector_math::cosine_similarity;

pub const DB_FILE_NAME: &str = "rag.db";

pub struct SqliteRagStore {
    pool: SqlitePool,
    collection: String,
    db_path: PathBuf,
}

impl SqliteRagStore {
    /// Opens (or creates) `rag.db` inside `directory`.
    pub async fn open(directory: &Path, collection: &str) -> Result<Self, RagError> {
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(RagError::storage)?;
        Self::with_path(directory.join(DB_FILE_NAME), collection).await
    }

    pub async fn with_path(db_path: PathBuf, collection: &str) -> Result<Self, RagError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(RagError::storage)?;

        let store = Self {
            pool,
            collection: collection.to_string(),
            db_path,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn init_schema(&self) -> Result<(), RagError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rag_passages (
                collection TEXT NOT NULL,
                passage_id TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (collection, passage_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(RagError::storage)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_passage(row: &sqlx::sqlite::SqliteRow) -> Result<Passage, RagError> {
        let metadata_str: String = row.get("metadata");
        let metadata: Metadata = serde_json::from_str(&metadata_str).map_err(RagError::storage)?;

        Ok(Passage {
            id: row.get("passage_id"),
            text: row.get("content"),
            metadata,
        })
    }
}

#[async_trait]
impl RagStore for SqliteRagStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert_batch(&self, items: Vec<(Passage, Vec<f32>)>) -> Result<(), RagError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(RagError::storage)?;

        for (passage, embedding) in &items {
            let blob = Self::serialize_embedding(embedding);
            let metadata_str = serde_json::to_string(&passage.metadata).map_err(RagError::storage)?;

            sqlx::query(
                "INSERT INTO rag_passages (collection, passage_id, content, metadata, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&self.collection)
            .bind(&passage.id)
            .bind(&passage.text)
            .bind(&metadata_str)
            .bind(&blob)
            .execute(&mut *tx)
            .await
            .map_err(RagError::storage)?;
        }

        tx.commit().await.map_err(RagError::storage)?;
        Ok(())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, RagError> {
        let rows = sqlx::query(
            "SELECT passage_id, content, metadata, embedding
             FROM rag_passages
             WHERE collection = ?1",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::storage)?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let embedding_bytes: Vec<u8> = row.get("embedding");
            let stored = Self::deserialize_embedding(&embedding_bytes);
            scored.push(ScoredPassage {
                passage: Self::row_to_passage(row)?,
                score: cosine_similarity(query_embedding, &stored),
            });
        }

        Ok(rank(scored, limit))
    }

    async fn count(&self) -> Result<usize, RagError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rag_passages WHERE collection = ?1")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(RagError::storage)?;

        Ok(count as usize)
    }

    async fn dimension(&self) -> Result<Option<usize>, RagError> {
        let bytes: Option<i64> = sqlx::query_scalar(
            "SELECT length(embedding) FROM rag_passages WHERE collection = ?1 LIMIT 1",
        )
        .bind(&self.collection)
        .fetch_optional(&self.pool)
        .await
        .map_err(RagError::storage)?;

        Ok(bytes.map(|len| len as usize / 4))
    }
}
