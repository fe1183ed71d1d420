//! Second-stage relevance ranking.
//!
//! [`Reranker`] reorders retrieved candidates by a [`RerankEngine`]'s
//! scores. Besides the `/rerank` cross-encoder of the HTTP provider, two
//! local engines ship with the crate: a hybrid of embedding similarity and
//! term coverage, and a keyword-coverage score that needs no model at all.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::types::ScoredPassage;
use crate::core::errors::{EngineError, RagError};
use crate::llm::{bounded, EmbeddingEngine, RerankEngine};
use crate::vector_math::{by_score_then_id, cosine_similarity};

pub struct Reranker {
    engine: Arc<dyn RerankEngine>,
    timeout: Duration,
}

impl Reranker {
    pub fn new(engine: Arc<dyn RerankEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Reorders `candidates` by engine score and keeps the best `top_n`.
    /// Returned scores are the engine's, not the retrieval similarities.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredPassage>,
        top_n: usize,
    ) -> Result<Vec<ScoredPassage>, RagError> {
        if top_n == 0 {
            return Err(RagError::InvalidInput("top_n must be at least 1".to_string()));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.passage.text.clone()).collect();
        let scores = bounded(self.timeout, self.engine.score(query, &texts))
            .await
            .map_err(|err| RagError::RerankFailure(err.to_string()))?;

        if scores.len() != candidates.len() {
            return Err(RagError::RerankFailure(format!(
                "{} returned {} scores for {} candidates",
                self.engine.name(),
                scores.len(),
                candidates.len()
            )));
        }

        let mut reranked: Vec<ScoredPassage> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| ScoredPassage {
                passage: candidate.passage,
                score,
            })
            .collect();
        reranked.sort_by(|a, b| by_score_then_id(a.score, &a.passage.id, b.score, &b.passage.id));
        reranked.truncate(top_n);
        Ok(reranked)
    }
}

/// Blends embedding similarity with query term coverage.
///
/// Cosine similarity alone reproduces the retrieval order, so the term
/// coverage share (`keyword_weight`) is what lets this pass reorder
/// candidates.
pub struct HybridRerankEngine {
    embedder: Arc<dyn EmbeddingEngine>,
    keyword_weight: f32,
}

impl HybridRerankEngine {
    pub fn new(embedder: Arc<dyn EmbeddingEngine>, keyword_weight: f32) -> Self {
        Self {
            embedder,
            keyword_weight: keyword_weight.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl RerankEngine for HybridRerankEngine {
    fn name(&self) -> &str {
        "hybrid"
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, EngineError> {
        let mut inputs = Vec::with_capacity(texts.len() + 1);
        inputs.push(query.to_string());
        inputs.extend(texts.iter().cloned());

        let embeddings = self.embedder.embed(&inputs).await?;
        if embeddings.len() != inputs.len() {
            return Err(EngineError::Response(format!(
                "embedding size mismatch: {} != {}",
                embeddings.len(),
                inputs.len()
            )));
        }

        let terms = query_terms(query);
        let query_embedding = &embeddings[0];
        Ok(embeddings[1..]
            .iter()
            .zip(texts)
            .map(|(candidate, text)| {
                let semantic = cosine_similarity(query_embedding, candidate);
                let lexical = KeywordRerankEngine::score_one(&terms, text);
                (1.0 - self.keyword_weight) * semantic + self.keyword_weight * lexical
            })
            .collect())
    }
}

/// Fraction of query terms that occur in the candidate text.
#[derive(Debug, Default, Clone)]
pub struct KeywordRerankEngine;

impl KeywordRerankEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn score_one(query_terms: &[String], text: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let text_lower = text.to_lowercase();
        query_terms
            .iter()
            .filter(|term| text_lower.contains(term.as_str()))
            .count() as f32
            / query_terms.len() as f32
    }
}

#[async_trait]
impl RerankEngine for KeywordRerankEngine {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, EngineError> {
        let terms = query_terms(query);
        Ok(texts
            .iter()
            .map(|text| Self::score_one(&terms, text))
            .collect())
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stub::{FailingEngine, ScriptedReranker};
    use crate::llm::HashingEmbedder;
    use crate::rag::types::{Metadata, Passage};

    fn candidate(id: &str, text: &str, score: f32) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                id: id.to_string(),
                text: text.to_string(),
                metadata: Metadata::new(),
            },
            score,
        }
    }

    fn ids(passages: &[ScoredPassage]) -> Vec<&str> {
        passages.iter().map(|p| p.passage.id.as_str()).collect()
    }

    #[tokio::test]
    async fn reorders_by_engine_score_and_truncates() {
        let reranker = Reranker::new(Arc::new(ScriptedReranker::by_length()), Duration::from_secs(1));
        let candidates = vec![
            candidate("a", "short", 0.9),
            candidate("b", "the longest candidate", 0.8),
            candidate("c", "medium text", 0.7),
        ];

        let reranked = reranker.rerank("q", candidates, 2).await.unwrap();
        assert_eq!(ids(&reranked), vec!["b", "c"]);
        assert_eq!(reranked[0].score, 21.0);
    }

    #[tokio::test]
    async fn equal_scores_break_ties_by_id() {
        let reranker = Reranker::new(
            Arc::new(ScriptedReranker::new(|_, texts| Ok(vec![0.5; texts.len()]))),
            Duration::from_secs(1),
        );
        let candidates = vec![candidate("z", "x", 0.9), candidate("m", "y", 0.8)];
        let reranked = reranker.rerank("q", candidates, 5).await.unwrap();
        assert_eq!(ids(&reranked), vec!["m", "z"]);
    }

    #[tokio::test]
    async fn empty_candidates_skip_engine() {
        let engine = Arc::new(FailingEngine::new());
        let reranker = Reranker::new(engine.clone(), Duration::from_secs(1));
        assert!(reranker.rerank("q", Vec::new(), 3).await.unwrap().is_empty());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn rejects_zero_top_n() {
        let reranker = Reranker::new(Arc::new(ScriptedReranker::by_length()), Duration::from_secs(1));
        let result = reranker.rerank("q", vec![candidate("a", "x", 1.0)], 0).await;
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn engine_errors_and_count_mismatch_fail() {
        let failing = Reranker::new(Arc::new(FailingEngine::new()), Duration::from_secs(1));
        assert!(matches!(
            failing.rerank("q", vec![candidate("a", "x", 1.0)], 1).await,
            Err(RagError::RerankFailure(_))
        ));

        let short = Reranker::new(
            Arc::new(ScriptedReranker::new(|_, _| Ok(vec![1.0]))),
            Duration::from_secs(1),
        );
        let result = short
            .rerank("q", vec![candidate("a", "x", 1.0), candidate("b", "y", 0.5)], 2)
            .await;
        assert!(matches!(result, Err(RagError::RerankFailure(_))));
    }

    #[tokio::test]
    async fn keyword_engine_prefers_term_coverage() {
        let reranker = Reranker::new(Arc::new(KeywordRerankEngine::new()), Duration::from_secs(1));
        let candidates = vec![
            candidate("a", "Grass is green.", 0.9),
            candidate("b", "The sky is blue.", 0.1),
        ];
        let reranked = reranker.rerank("Sky blue?", candidates, 1).await.unwrap();
        assert_eq!(ids(&reranked), vec!["b"]);
        assert_eq!(reranked[0].score, 1.0);
    }

    #[tokio::test]
    async fn hybrid_engine_can_overturn_retrieval_order() {
        let embedder = Arc::new(HashingEmbedder::new(4096));
        let texts = vec![
            "sky sky sky sky".to_string(),
            "sky blue and many other words here today".to_string(),
        ];

        // Pure similarity prefers the first text.
        let vectors = embedder
            .embed(&["sky blue".to_string(), texts[0].clone(), texts[1].clone()])
            .await
            .unwrap();
        assert!(
            cosine_similarity(&vectors[0], &vectors[1]) > cosine_similarity(&vectors[0], &vectors[2])
        );

        let reranker = Reranker::new(
            Arc::new(HybridRerankEngine::new(embedder, 0.5)),
            Duration::from_secs(1),
        );
        let candidates = vec![
            candidate("a", &texts[0], 0.7),
            candidate("b", &texts[1], 0.5),
        ];
        let reranked = reranker.rerank("sky blue", candidates, 2).await.unwrap();
        assert_eq!(ids(&reranked), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn hybrid_weight_zero_is_plain_similarity() {
        let engine = HybridRerankEngine::new(Arc::new(HashingEmbedder::new(256)), 0.0);
        let scores = engine
            .score(
                "what color is the sky",
                &["The sky is blue.".to_string(), "Grass grows green in spring.".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn repeated_query_terms_count_once() {
        let terms = query_terms("Sky, sky and SKY?");
        assert_eq!(terms, vec!["and".to_string(), "sky".to_string()]);
    }
}
