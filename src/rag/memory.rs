use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{rank, RagStore};
use super::types::{Passage, ScoredPassage};
use crate::core::errors::RagError;
use crate::vector_math::cosine_similarity;

struct Entry {
    passage: Passage,
    embedding: Vec<f32>,
}

/// Volatile store; contents are lost when the process exits.
pub struct MemoryRagStore {
    collection: String,
    entries: RwLock<Vec<Entry>>,
}

impl MemoryRagStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RagStore for MemoryRagStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert_batch(&self, items: Vec<(Passage, Vec<f32>)>) -> Result<(), RagError> {
        let mut entries = self.entries.write().await;
        entries.extend(
            items
                .into_iter()
                .map(|(passage, embedding)| Entry { passage, embedding }),
        );
        Ok(())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPassage>, RagError> {
        let entries = self.entries.read().await;
        let scored = entries
            .iter()
            .map(|entry| ScoredPassage {
                passage: entry.passage.clone(),
                score: cosine_similarity(query_embedding, &entry.embedding),
            })
            .collect();
        Ok(rank(scored, limit))
    }

    async fn count(&self) -> Result<usize, RagError> {
        Ok(self.entries.read().await.len())
    }

    async fn dimension(&self) -> Result<Option<usize>, RagError> {
        Ok(self
            .entries
            .read()
            .await
            .first()
            .map(|entry| entry.embedding.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::Metadata;

    fn passage(id: &str, text: &str) -> Passage {
        Passage {
            id: id.to_string(),
            text: text.to_string(),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn search_returns_closest_first() {
        let store = MemoryRagStore::new("test");
        store
            .insert_batch(vec![
                (passage("a", "east"), vec![1.0, 0.0]),
                (passage("b", "north"), vec![0.0, 1.0]),
                (passage("c", "north-east"), vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let results = store.search(&[0.0, 1.0], 2).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.passage.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(store.count().await.unwrap(), 3);
        assert!(!store.is_persistent());
    }

    #[tokio::test]
    async fn limit_larger_than_store_returns_everything() {
        let store = MemoryRagStore::new("test");
        store
            .insert_batch(vec![(passage("a", "only"), vec![1.0])])
            .await
            .unwrap();
        assert_eq!(store.search(&[1.0], 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dimension_follows_first_entry() {
        let store = MemoryRagStore::new("test");
        assert_eq!(store.dimension().await.unwrap(), None);
        store
            .insert_batch(vec![(passage("a", "x"), vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.dimension().await.unwrap(), Some(3));
    }
}
