//! RagStore trait: storage backends for embedded passages.
//!
//! Stores own passages together with their embedding vectors and answer
//! brute-force cosine similarity queries. `MemoryRagStore` keeps everything
//! in process; `SqliteRagStore` persists to a SQLite file.

use async_trait::async_trait;

use super::types::{Passage, ScoredPassage};
use crate::core::errors::RagError;
use crate::vector_math::by_score_then_id;

#[async_trait]
pub trait RagStore: Send + Sync {
    fn collection(&self) -> &str;

    fn is_persistent(&self) -> bool;

    /// Inserts every item or none of them.
    async fn insert_batch(&self, items: Vec<(Passage, Vec<f32>)>) -> Result<(), RagError>;

    /// Returns up to `limit` passages ordered by descending similarity,
    /// ties broken by ascending passage id.
    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, RagError>;

    async fn count(&self) -> Result<usize, RagError>;

    /// Length of the stored embeddings, `None` while the collection is empty.
    async fn dimension(&self) -> Result<Option<usize>, RagError>;
}

/// Sorts in result order and keeps the first `limit` entries.
pub(crate) fn rank(mut scored: Vec<ScoredPassage>, limit: usize) -> Vec<ScoredPassage> {
    scored.sort_by(|a, b| by_score_then_id(a.score, &a.passage.id, b.score, &b.passage.id));
    scored.truncate(limit);
    scored
}
