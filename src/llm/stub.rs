//! Deterministic in-process engines.
//!
//! Used by the unit and integration tests to script engine behaviour
//! (fixed or echoed completions, slow or failing calls, long streams) and to
//! count how often each engine was invoked.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::provider::{EmbeddingEngine, FragmentReceiver, GenerativeEngine, RerankEngine};
use crate::core::errors::EngineError;

type Responder = dyn Fn(&str) -> Result<String, EngineError> + Send + Sync;
type Scorer = dyn Fn(&str, &[String]) -> Result<Vec<f32>, EngineError> + Send + Sync;

/// Generative engine whose output is a function of the prompt. Streams split
/// the output after every space, so the fragments concatenate back to the
/// batch completion.
pub struct ScriptedGenerator {
    responder: Arc<Responder>,
    latency: Duration,
    fragment_delay: Duration,
    fail_after: Option<usize>,
    completions: AtomicUsize,
    streams: AtomicUsize,
    produced: Arc<AtomicUsize>,
}

impl ScriptedGenerator {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, EngineError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            latency: Duration::ZERO,
            fragment_delay: Duration::ZERO,
            fail_after: None,
            completions: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
            produced: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answers with the prompt itself.
    pub fn echo() -> Self {
        Self::new(|prompt| Ok(prompt.to_string()))
    }

    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(text.clone()))
    }

    /// Delay before a completion returns or a stream opens.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    /// Streams emit `count` fragments and then an engine error.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    /// Fragments handed to stream consumers so far.
    pub fn fragments_produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }
}

pub fn split_fragments(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl GenerativeEngine for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String, EngineError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.responder)(prompt)
    }

    async fn complete_stream(&self, prompt: &str) -> Result<FragmentReceiver, EngineError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let fragments = split_fragments(&(self.responder)(prompt)?);

        let (tx, rx) = mpsc::channel(1);
        let produced = self.produced.clone();
        let delay = self.fragment_delay;
        let fail_after = self.fail_after;

        tokio::spawn(async move {
            for (index, fragment) in fragments.into_iter().enumerate() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail_after == Some(index) {
                    let _ = tx
                        .send(Err(EngineError::Unavailable("scripted stream failure".into())))
                        .await;
                    return;
                }
                if tx.is_closed() {
                    return;
                }
                produced.fetch_add(1, Ordering::SeqCst);
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
            if fail_after.is_some() {
                let _ = tx
                    .send(Err(EngineError::Unavailable("scripted stream failure".into())))
                    .await;
            }
        });

        Ok(rx)
    }
}

/// Rerank engine backed by a scoring closure.
pub struct ScriptedReranker {
    scorer: Arc<Scorer>,
    latency: Duration,
    calls: AtomicUsize,
}

impl ScriptedReranker {
    pub fn new<F>(scorer: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<Vec<f32>, EngineError> + Send + Sync + 'static,
    {
        Self {
            scorer: Arc::new(scorer),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Scores by text length, longest first.
    pub fn by_length() -> Self {
        Self::new(|_, texts| Ok(texts.iter().map(|t| t.chars().count() as f32).collect()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RerankEngine for ScriptedReranker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.scorer)(query, texts)
    }
}

/// Engine that fails every call of every kind.
#[derive(Default)]
pub struct FailingEngine {
    calls: AtomicUsize,
}

impl FailingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Unavailable("scripted failure".to_string()))
    }
}

#[async_trait]
impl EmbeddingEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EngineError> {
        self.fail()
    }
}

#[async_trait]
impl GenerativeEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, EngineError> {
        self.fail()
    }

    async fn complete_stream(&self, _prompt: &str) -> Result<FragmentReceiver, EngineError> {
        self.fail()
    }
}

#[async_trait]
impl RerankEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>, EngineError> {
        self.fail()
    }
}
