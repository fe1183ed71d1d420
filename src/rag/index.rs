use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::RagStore;
use super::types::{IndexStatus, MetadataValue, NewPassage, Passage, ScoredPassage};
use crate::core::errors::{EngineError, RagError};
use crate::llm::{bounded, EmbeddingEngine};

/// Embeds passages and answers similarity queries against a [`RagStore`].
///
/// Writers are serialized; readers never wait on them and may not yet see
/// a batch that is still being added.
pub struct VectorIndex {
    embedder: Arc<dyn EmbeddingEngine>,
    store: Arc<dyn RagStore>,
    write_lock: Mutex<()>,
    embed_timeout: Duration,
}

impl VectorIndex {
    pub fn new(
        embedder: Arc<dyn EmbeddingEngine>,
        store: Arc<dyn RagStore>,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            write_lock: Mutex::new(()),
            embed_timeout,
        }
    }

    /// Embeds and stores a batch, returning the assigned ids in input order.
    /// Nothing is stored unless every passage was embedded.
    pub async fn add(&self, passages: Vec<NewPassage>) -> Result<Vec<String>, RagError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;

        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = bounded(self.embed_timeout, self.embedder.embed(&texts))
            .await
            .map_err(RagError::EmbeddingFailure)?;
        check_vectors(&vectors, texts.len())?;
        if let (Some(stored), Some(batch)) = (self.store.dimension().await?, vectors.first()) {
            if stored != batch.len() {
                return Err(RagError::EmbeddingFailure(EngineError::Response(format!(
                    "collection {} holds {}-dimensional embeddings, got {}",
                    self.store.collection(),
                    stored,
                    batch.len()
                ))));
            }
        }

        let ingested_at = Utc::now().to_rfc3339();
        let items: Vec<(Passage, Vec<f32>)> = passages
            .into_iter()
            .zip(vectors)
            .map(|(new, vector)| {
                let mut metadata = new.metadata;
                metadata.insert(
                    "ingested_at".to_string(),
                    MetadataValue::from(ingested_at.as_str()),
                );
                let passage = Passage {
                    id: Uuid::new_v4().to_string(),
                    text: new.text,
                    metadata,
                };
                (passage, vector)
            })
            .collect();
        let ids = items.iter().map(|(p, _)| p.id.clone()).collect();

        self.store.insert_batch(items).await?;
        tracing::debug!(
            collection = self.store.collection(),
            count = texts.len(),
            "Indexed passages"
        );
        Ok(ids)
    }

    /// Top `k` passages by similarity to `query`.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredPassage>, RagError> {
        if k == 0 {
            return Err(RagError::InvalidInput("k must be at least 1".to_string()));
        }
        if self.store.count().await? == 0 {
            return Ok(Vec::new());
        }

        let vectors = bounded(self.embed_timeout, self.embedder.embed(&[query.to_string()]))
            .await
            .map_err(|err| RagError::RetrievalFailure(err.to_string()))?;
        let query_vector = match vectors.into_iter().next() {
            Some(vector) if !vector.is_empty() => vector,
            _ => {
                return Err(RagError::RetrievalFailure(
                    "embedding engine returned no query vector".to_string(),
                ))
            }
        };

        if let Some(stored) = self.store.dimension().await? {
            if stored != query_vector.len() {
                return Err(RagError::RetrievalFailure(format!(
                    "query embedding has {} dimensions, collection {} holds {}",
                    query_vector.len(),
                    self.store.collection(),
                    stored
                )));
            }
        }

        self.store.search(&query_vector, k).await
    }

    pub async fn status(&self) -> Result<IndexStatus, RagError> {
        Ok(IndexStatus {
            collection_name: self.store.collection().to_string(),
            document_count: self.store.count().await?,
            is_persistent: self.store.is_persistent(),
        })
    }
}

fn check_vectors(vectors: &[Vec<f32>], expected: usize) -> Result<(), RagError> {
    if vectors.len() != expected {
        return Err(RagError::EmbeddingFailure(EngineError::Response(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        ))));
    }
    let Some(dimensions) = vectors.first().map(Vec::len) else {
        return Ok(());
    };
    if dimensions == 0 {
        return Err(RagError::EmbeddingFailure(EngineError::Response(
            "empty embedding vector".to_string(),
        )));
    }
    if vectors.iter().any(|v| v.len() != dimensions) {
        return Err(RagError::EmbeddingFailure(EngineError::Response(
            "embedding dimensions are inconsistent".to_string(),
        )));
    }
    Ok(())
}
