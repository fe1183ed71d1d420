use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::errors::EngineError;

/// Lazy, finite sequence of generated text fragments. The producer stops as
/// soon as the receiver is dropped.
pub type FragmentReceiver = mpsc::Receiver<Result<String, EngineError>>;

#[async_trait]
pub trait EmbeddingEngine: Send + Sync {
    fn name(&self) -> &str;

    /// One fixed-length vector per input, same order. Fails atomically.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError>;
}

#[async_trait]
pub trait GenerativeEngine: Send + Sync {
    fn name(&self) -> &str;

    /// completion (non-streaming)
    async fn complete(&self, prompt: &str) -> Result<String, EngineError>;

    /// completion (streaming)
    async fn complete_stream(&self, prompt: &str) -> Result<FragmentReceiver, EngineError>;
}

#[async_trait]
pub trait RerankEngine: Send + Sync {
    fn name(&self) -> &str;

    /// One relevance score per text, same order as the input.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, EngineError>;
}

/// Runs an engine call under a deadline.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let value = bounded(Duration::from_secs(1), async { Ok::<_, EngineError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let result = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, EngineError>(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }
}
