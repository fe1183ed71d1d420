//! Grounded answer generation, batch and streaming.
//!
//! Streaming runs a single producer task per request. The producer forwards
//! engine fragments through a bounded channel and checks the request's
//! cancellation token (and whether the consumer hung up) before every
//! emission, so a disconnected client stops engine consumption within one
//! fragment.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::errors::RagError;
use crate::llm::{bounded, GenerativeEngine};

const RAG_TEMPLATE: &str = "Use the context provided to answer the user's question.
If you cannot answer based on the context, say you don't know.

Context:
{context}

Question: {query}

Answer:";

pub fn answer_prompt(query: &str, context: &str) -> String {
    RAG_TEMPLATE
        .replace("{context}", context)
        .replace("{query}", query)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StreamEvent {
    Fragment(String),
    Completed,
    Failed(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment(_))
    }
}

/// How a producer task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

pub struct GenerationStream {
    pub events: mpsc::Receiver<StreamEvent>,
    pub producer: JoinHandle<StreamOutcome>,
}

pub struct AnswerGenerator {
    engine: Arc<dyn GenerativeEngine>,
    timeout: Duration,
    stream_buffer: usize,
}

impl AnswerGenerator {
    pub fn new(engine: Arc<dyn GenerativeEngine>, timeout: Duration) -> Self {
        Self {
            engine,
            timeout,
            stream_buffer: 1,
        }
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub async fn generate(&self, query: &str, context: &str) -> Result<String, RagError> {
        let prompt = answer_prompt(query, context);
        bounded(self.timeout, self.engine.complete(&prompt))
            .await
            .map_err(|err| RagError::GenerationFailure(err.to_string()))
    }

    /// Spawns the producer and returns its event channel. The sequence ends
    /// with exactly one terminal event unless it was cancelled.
    pub fn generate_stream(
        &self,
        query: &str,
        context: &str,
        cancel: CancellationToken,
    ) -> GenerationStream {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let producer = tokio::spawn(produce(
            self.engine.clone(),
            answer_prompt(query, context),
            self.timeout,
            tx,
            cancel,
        ));
        GenerationStream {
            events: rx,
            producer,
        }
    }
}

async fn produce(
    engine: Arc<dyn GenerativeEngine>,
    prompt: String,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> StreamOutcome {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(),
        _ = tx.closed() => return cancelled(),
        opened = bounded(timeout, engine.complete_stream(&prompt)) => opened,
    };
    let mut fragments = match opened {
        Ok(fragments) => fragments,
        Err(err) => return fail(&tx, &cancel, format!("could not open stream: {}", err)).await,
    };

    let mut emitted = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            _ = tx.closed() => return cancelled(),
            next = tokio::time::timeout(timeout, fragments.recv()) => next,
        };

        match next {
            Err(_) => {
                return fail(&tx, &cancel, format!("no fragment within {:?}", timeout)).await;
            }
            Ok(Some(Err(err))) => return fail(&tx, &cancel, err.to_string()).await,
            Ok(Some(Ok(fragment))) => {
                if fragment.is_empty() {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled(),
                    sent = tx.send(StreamEvent::Fragment(fragment)) => {
                        if sent.is_err() {
                            return cancelled();
                        }
                    }
                }
                emitted += 1;
            }
            Ok(None) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled(),
                    _ = tx.send(StreamEvent::Completed) => {}
                }
                tracing::debug!(fragments = emitted, "Generation stream completed");
                return StreamOutcome::Completed;
            }
        }
    }
}

fn cancelled() -> StreamOutcome {
    tracing::info!("Generation stream stopped: {}", RagError::CancelledByClient);
    StreamOutcome::Cancelled
}

async fn fail(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    reason: String,
) -> StreamOutcome {
    let error = RagError::GenerationFailure(reason.clone());
    tracing::error!("{}", error);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(),
        _ = tx.send(StreamEvent::Failed(error.to_string())) => {}
    }
    StreamOutcome::Failed(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stub::{FailingEngine, ScriptedGenerator};

    async fn collect(stream: &mut GenerationStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn prompt_places_context_and_query() {
        let prompt = answer_prompt("What color is the sky?", "The sky is blue.");
        assert!(prompt.starts_with("Use the context provided to answer the user's question.\n"));
        assert!(prompt.contains("Context:\nThe sky is blue.\n\nQuestion: What color is the sky?\n\nAnswer:"));
    }

    #[tokio::test]
    async fn generate_returns_engine_text() {
        let generator = AnswerGenerator::new(
            Arc::new(ScriptedGenerator::fixed("It is blue.")),
            Duration::from_secs(1),
        );
        assert_eq!(generator.generate("q", "ctx").await.unwrap(), "It is blue.");
    }

    #[tokio::test]
    async fn generate_maps_failures() {
        let generator = AnswerGenerator::new(Arc::new(FailingEngine::new()), Duration::from_secs(1));
        assert!(matches!(
            generator.generate("q", "ctx").await,
            Err(RagError::GenerationFailure(_))
        ));

        let slow = AnswerGenerator::new(
            Arc::new(ScriptedGenerator::fixed("late").with_latency(Duration::from_millis(200))),
            Duration::from_millis(20),
        );
        assert!(matches!(
            slow.generate("q", "ctx").await,
            Err(RagError::GenerationFailure(_))
        ));
    }

    #[tokio::test]
    async fn stream_ends_with_completed() {
        let engine = Arc::new(ScriptedGenerator::fixed("one two three"));
        let generator = AnswerGenerator::new(engine.clone(), Duration::from_secs(1));
        let mut stream = generator.generate_stream("q", "ctx", CancellationToken::new());

        let events = collect(&mut stream).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Fragment("one ".into()),
                StreamEvent::Fragment("two ".into()),
                StreamEvent::Fragment("three".into()),
                StreamEvent::Completed,
            ]
        );
        assert_eq!(stream.producer.await.unwrap(), StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn engine_error_mid_stream_is_terminal_failure() {
        let engine = Arc::new(ScriptedGenerator::fixed("a b c d").failing_after(2));
        let generator = AnswerGenerator::new(engine, Duration::from_secs(1));
        let mut stream = generator.generate_stream("q", "ctx", CancellationToken::new());

        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events.last(), Some(StreamEvent::Failed(_))));
        assert!(matches!(stream.producer.await.unwrap(), StreamOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn open_failure_is_terminal_failure() {
        let generator = AnswerGenerator::new(Arc::new(FailingEngine::new()), Duration::from_secs(1));
        let mut stream = generator.generate_stream("q", "ctx", CancellationToken::new());
        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Failed(_)));
    }

    #[tokio::test]
    async fn fragment_gap_timeout_fails_the_stream() {
        let engine = Arc::new(
            ScriptedGenerator::fixed("slow words here").with_fragment_delay(Duration::from_millis(300)),
        );
        let generator = AnswerGenerator::new(engine, Duration::from_millis(50));
        let mut stream = generator.generate_stream("q", "ctx", CancellationToken::new());
        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Failed(_)));
    }

    #[tokio::test]
    async fn cancel_stops_the_producer_without_terminal_event() {
        let engine = Arc::new(
            ScriptedGenerator::fixed("tok ".repeat(200)).with_fragment_delay(Duration::from_millis(5)),
        );
        let generator = AnswerGenerator::new(engine.clone(), Duration::from_secs(1));
        let token = CancellationToken::new();
        let mut stream = generator.generate_stream("q", "ctx", token.clone());

        for _ in 0..3 {
            assert!(matches!(stream.events.recv().await, Some(StreamEvent::Fragment(_))));
        }
        token.cancel();

        assert_eq!(stream.producer.await.unwrap(), StreamOutcome::Cancelled);
        let produced = engine.fragments_produced();
        assert!(produced <= 7, "produced {} fragments", produced);

        while let Some(event) = stream.events.recv().await {
            assert!(!event.is_terminal());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.fragments_produced(), produced);
    }

    #[tokio::test]
    async fn dropped_consumer_stops_the_producer() {
        let engine = Arc::new(
            ScriptedGenerator::fixed("tok ".repeat(200)).with_fragment_delay(Duration::from_millis(5)),
        );
        let generator = AnswerGenerator::new(engine.clone(), Duration::from_secs(1));
        let mut stream = generator.generate_stream("q", "ctx", CancellationToken::new());

        for _ in 0..3 {
            assert!(stream.events.recv().await.is_some());
        }
        let GenerationStream { events, producer } = stream;
        drop(events);

        assert_eq!(producer.await.unwrap(), StreamOutcome::Cancelled);
        let produced = engine.fragments_produced();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.fragments_produced(), produced);
        assert!(produced < 200);
    }
}
