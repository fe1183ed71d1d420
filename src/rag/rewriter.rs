use std::sync::Arc;
use std::time::Duration;

use crate::core::errors::RagError;
use crate::llm::{bounded, GenerativeEngine};

const REWRITE_TEMPLATE: &str = "Rewrite this query for semantic search.
Return only the rewritten query, no comments.

Query: {query}

Rewritten:";

pub fn rewrite_prompt(query: &str) -> String {
    REWRITE_TEMPLATE.replace("{query}", query)
}

/// Outcome of a fail-open rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct Rewrite {
    pub query: String,
    /// The engine failed and `query` is the caller's original text.
    pub fell_back: bool,
}

/// Reformulates user questions into retrieval-friendly queries.
pub struct QueryRewriter {
    engine: Arc<dyn GenerativeEngine>,
    timeout: Duration,
    enabled: bool,
}

impl QueryRewriter {
    pub fn new(engine: Arc<dyn GenerativeEngine>, timeout: Duration) -> Self {
        Self {
            engine,
            timeout,
            enabled: true,
        }
    }

    /// A disabled rewriter passes queries through without calling the engine.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub async fn try_rewrite(&self, query: &str) -> Result<String, RagError> {
        let output = bounded(self.timeout, self.engine.complete(&rewrite_prompt(query)))
            .await
            .map_err(|err| RagError::RewriteFailure(err.to_string()))?;

        let rewritten = output.trim();
        if rewritten.is_empty() {
            return Err(RagError::RewriteFailure(
                "engine returned an empty rewrite".to_string(),
            ));
        }
        Ok(rewritten.to_string())
    }

    pub async fn rewrite(&self, query: &str) -> Rewrite {
        if !self.enabled {
            return Rewrite {
                query: query.to_string(),
                fell_back: false,
            };
        }

        match self.try_rewrite(query).await {
            Ok(rewritten) => Rewrite {
                query: rewritten,
                fell_back: false,
            },
            Err(err) => {
                tracing::warn!("Query rewrite failed, using original query: {}", err);
                Rewrite {
                    query: query.to_string(),
                    fell_back: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stub::{FailingEngine, ScriptedGenerator};

    #[test]
    fn prompt_embeds_the_query() {
        let prompt = rewrite_prompt("what color is the sky?");
        assert!(prompt.starts_with("Rewrite this query for semantic search.\n"));
        assert!(prompt.contains("Query: what color is the sky?\n\nRewritten:"));
    }

    #[tokio::test]
    async fn trims_engine_output() {
        let rewriter = QueryRewriter::new(
            Arc::new(ScriptedGenerator::fixed("  sky color  \n")),
            Duration::from_secs(1),
        );
        let rewrite = rewriter.rewrite("what color is the sky?").await;
        assert_eq!(rewrite.query, "sky color");
        assert!(!rewrite.fell_back);
    }

    #[tokio::test]
    async fn engine_failure_falls_back_to_original() {
        let rewriter = QueryRewriter::new(Arc::new(FailingEngine::new()), Duration::from_secs(1));
        assert!(matches!(
            rewriter.try_rewrite("q").await,
            Err(RagError::RewriteFailure(_))
        ));

        let rewrite = rewriter.rewrite("what color is the sky?").await;
        assert_eq!(rewrite.query, "what color is the sky?");
        assert!(rewrite.fell_back);
    }

    #[tokio::test]
    async fn blank_output_counts_as_failure() {
        let rewriter = QueryRewriter::new(
            Arc::new(ScriptedGenerator::fixed(" \n\t")),
            Duration::from_secs(1),
        );
        let rewrite = rewriter.rewrite("original").await;
        assert_eq!(rewrite.query, "original");
        assert!(rewrite.fell_back);
    }

    #[tokio::test]
    async fn timeout_falls_back() {
        let rewriter = QueryRewriter::new(
            Arc::new(ScriptedGenerator::fixed("late").with_latency(Duration::from_millis(200))),
            Duration::from_millis(20),
        );
        let rewrite = rewriter.rewrite("original").await;
        assert_eq!(rewrite.query, "original");
        assert!(rewrite.fell_back);
    }

    #[tokio::test]
    async fn disabled_rewriter_skips_engine() {
        let engine = Arc::new(FailingEngine::new());
        let rewriter =
            QueryRewriter::new(engine.clone(), Duration::from_secs(1)).with_enabled(false);
        let rewrite = rewriter.rewrite("original").await;
        assert_eq!(rewrite.query, "original");
        assert!(!rewrite.fell_back);
        assert_eq!(engine.calls(), 0);
    }
}
