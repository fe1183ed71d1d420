//! Pipeline orchestration: ingest, search and grounded answering.
//!
//! An answer run moves through `Rewriting -> Retrieving -> Reranking ->
//! Generating` and ends in `Completed` or `Failed`. Rewrite and rerank
//! failures degrade the run instead of aborting it; retrieval and
//! generation failures are fatal for the run only.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::chunker::Chunker;
use super::context_builder::{ContextBuilder, ContextBuilderConfig, RankedContext};
use super::generator::{AnswerGenerator, StreamEvent, StreamOutcome};
use super::index::VectorIndex;
use super::memory::MemoryRagStore;
use super::reranker::{HybridRerankEngine, KeywordRerankEngine, Reranker};
use super::rewriter::QueryRewriter;
use super::store::RagStore;
use super::types::{Document, IndexStatus, Metadata, MetadataValue, SourceExcerpt};
use crate::core::config::{AppSettings, RerankEngineKind, RerankFallback};
use crate::core::errors::RagError;
use crate::llm::{EmbeddingEngine, GenerativeEngine, RerankEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Rewriting,
    Retrieving,
    Reranking,
    Generating,
    Completed,
    Failed,
}

impl PipelineStage {
    fn order(self) -> u8 {
        match self {
            PipelineStage::Rewriting => 0,
            PipelineStage::Retrieving => 1,
            PipelineStage::Reranking => 2,
            PipelineStage::Generating => 3,
            PipelineStage::Completed | PipelineStage::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedStage {
    Rewrite,
    Rerank,
}

/// Per-request state of one answer run.
#[derive(Debug)]
pub struct PipelineRun {
    request_id: Uuid,
    stage: PipelineStage,
    degraded: Vec<DegradedStage>,
}

impl PipelineRun {
    pub fn new() -> Self {
        let run = Self {
            request_id: Uuid::new_v4(),
            stage: PipelineStage::Rewriting,
            degraded: Vec::new(),
        };
        tracing::debug!(request_id = %run.request_id, stage = ?run.stage, "Pipeline run started");
        run
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn degraded(&self) -> &[DegradedStage] {
        &self.degraded
    }

    /// Moves forward only; terminal stages are final.
    fn advance(&mut self, next: PipelineStage) {
        if self.stage.is_terminal() || next.order() <= self.stage.order() {
            return;
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = ?self.stage,
            to = ?next,
            "Pipeline stage transition"
        );
        self.stage = next;
    }

    fn degrade(&mut self, stage: DegradedStage, err: &RagError) {
        tracing::warn!(
            request_id = %self.request_id,
            stage = ?stage,
            "Continuing degraded: {}",
            err
        );
        self.degraded.push(stage);
    }

    fn fail(&mut self, err: &RagError) {
        if self.stage.is_terminal() {
            return;
        }
        if matches!(err, RagError::CancelledByClient) {
            tracing::info!(request_id = %self.request_id, stage = ?self.stage, "{}", err);
        } else {
            tracing::error!(request_id = %self.request_id, stage = ?self.stage, "Pipeline run failed: {}", err);
        }
        self.stage = PipelineStage::Failed;
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub document_id: String,
    pub passage_ids: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub passage_id: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer_text: String,
    pub sources: Vec<SourceExcerpt>,
    pub rewritten_query: String,
    pub degraded: Vec<DegradedStage>,
}

struct Prepared {
    rewritten_query: String,
    context: RankedContext,
}

pub struct RagPipeline {
    chunker: Chunker,
    index: VectorIndex,
    rewriter: QueryRewriter,
    reranker: Reranker,
    generator: AnswerGenerator,
    context_builder: ContextBuilder,
    retrieval_k: usize,
    rerank_top_n: usize,
    rerank_fallback: RerankFallback,
}

impl RagPipeline {
    pub fn builder(settings: AppSettings) -> RagPipelineBuilder {
        RagPipelineBuilder::new(settings)
    }

    pub async fn ingest(&self, document: Document) -> Result<IngestReceipt, RagError> {
        if document.text.trim().is_empty() {
            return Err(RagError::EmptyInput("document text is empty".to_string()));
        }

        let document_id = Uuid::new_v4().to_string();
        let mut passages = self.chunker.chunk_document(&document);
        for passage in &mut passages {
            passage.metadata.insert(
                "document_id".to_string(),
                MetadataValue::from(document_id.as_str()),
            );
        }

        let passage_ids = self.index.add(passages).await?;
        tracing::info!(
            document_id = %document_id,
            chunks = passage_ids.len(),
            "Ingested document"
        );
        Ok(IngestReceipt {
            document_id,
            count: passage_ids.len(),
            passage_ids,
        })
    }

    /// Plain similarity search, no rewriting or reranking.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, RagError> {
        let query = non_empty_query(query)?;
        let results = self.index.search(query, top_k).await?;
        Ok(results
            .into_iter()
            .map(|scored| SearchHit {
                passage_id: scored.passage.id,
                text: scored.passage.text,
                metadata: scored.passage.metadata,
                score: scored.score,
            })
            .collect())
    }

    pub async fn status(&self) -> Result<IndexStatus, RagError> {
        self.index.status().await
    }

    pub async fn answer(&self, query: &str) -> Result<Answer, RagError> {
        let query = non_empty_query(query)?;
        let mut run = PipelineRun::new();

        let result = self.answer_in_run(query, &mut run).await;
        match &result {
            Ok(_) => run.advance(PipelineStage::Completed),
            Err(err) => run.fail(err),
        }
        result
    }

    async fn answer_in_run(&self, query: &str, run: &mut PipelineRun) -> Result<Answer, RagError> {
        let prepared = self.prepare(query, run).await?;
        run.advance(PipelineStage::Generating);
        let answer_text = self
            .generator
            .generate(query, &prepared.context.text)
            .await?;

        Ok(Answer {
            answer_text,
            sources: prepared.context.sources,
            rewritten_query: prepared.rewritten_query,
            degraded: run.degraded().to_vec(),
        })
    }

    pub async fn answer_stream(&self, query: &str) -> Result<AnswerStream, RagError> {
        self.answer_stream_with(query, &CancellationToken::new()).await
    }

    /// Runs the pre-generation stages and returns the live stream. The
    /// stream's token is a child of `parent`, so cancelling `parent` (for
    /// example when a connection closes) stops it too.
    pub async fn answer_stream_with(
        &self,
        query: &str,
        parent: &CancellationToken,
    ) -> Result<AnswerStream, RagError> {
        let query = non_empty_query(query)?;
        let token = parent.child_token();
        let mut run = PipelineRun::new();

        let prepared = tokio::select! {
            biased;
            _ = token.cancelled() => Err(RagError::CancelledByClient),
            prepared = self.prepare(query, &mut run) => prepared,
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                run.fail(&err);
                return Err(err);
            }
        };

        run.advance(PipelineStage::Generating);
        let stream = self
            .generator
            .generate_stream(query, &prepared.context.text, token.clone());

        Ok(AnswerStream {
            degraded: run.degraded().to_vec(),
            run,
            sources: prepared.context.sources,
            rewritten_query: prepared.rewritten_query,
            events: stream.events,
            producer: Some(stream.producer),
            token,
            terminated: false,
        })
    }

    async fn prepare(&self, query: &str, run: &mut PipelineRun) -> Result<Prepared, RagError> {
        run.advance(PipelineStage::Rewriting);
        let rewrite = self.rewriter.rewrite(query).await;
        if rewrite.fell_back {
            run.degrade(
                DegradedStage::Rewrite,
                &RagError::RewriteFailure("using the original query".to_string()),
            );
        }

        run.advance(PipelineStage::Retrieving);
        let retrieved = self
            .index
            .search(&rewrite.query, self.retrieval_k)
            .await?;

        run.advance(PipelineStage::Reranking);
        let ranked = match self
            .reranker
            .rerank(&rewrite.query, retrieved.clone(), self.rerank_top_n)
            .await
        {
            Ok(ranked) => ranked,
            Err(err)
                if err.is_recoverable() && self.rerank_fallback == RerankFallback::RetrievalOrder =>
            {
                run.degrade(DegradedStage::Rerank, &err);
                retrieved.into_iter().take(self.rerank_top_n).collect()
            }
            Err(err) => return Err(err),
        };

        Ok(Prepared {
            rewritten_query: rewrite.query,
            context: self.context_builder.build(&ranked),
        })
    }
}

fn non_empty_query(query: &str) -> Result<&str, RagError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(RagError::EmptyInput("query is empty".to_string()));
    }
    Ok(trimmed)
}

/// Live answer stream of one run. Dropping it cancels generation.
pub struct AnswerStream {
    run: PipelineRun,
    sources: Vec<SourceExcerpt>,
    rewritten_query: String,
    degraded: Vec<DegradedStage>,
    events: mpsc::Receiver<StreamEvent>,
    producer: Option<JoinHandle<StreamOutcome>>,
    token: CancellationToken,
    terminated: bool,
}

impl AnswerStream {
    pub fn request_id(&self) -> Uuid {
        self.run.request_id()
    }

    pub fn sources(&self) -> &[SourceExcerpt] {
        &self.sources
    }

    pub fn rewritten_query(&self) -> &str {
        &self.rewritten_query
    }

    pub fn degraded(&self) -> &[DegradedStage] {
        &self.degraded
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Next event, or `None` once a terminal event was returned or the
    /// stream was cancelled.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.terminated {
            return None;
        }

        let event = if self.token.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                event = self.events.recv() => event,
            }
        };

        match event {
            Some(StreamEvent::Fragment(fragment)) => Some(StreamEvent::Fragment(fragment)),
            Some(terminal) => {
                self.terminated = true;
                match &terminal {
                    StreamEvent::Failed(reason) => {
                        self.run.fail(&RagError::GenerationFailure(reason.clone()))
                    }
                    _ => self.run.advance(PipelineStage::Completed),
                }
                Some(terminal)
            }
            None => {
                self.terminated = true;
                if self.token.is_cancelled() {
                    self.run.fail(&RagError::CancelledByClient);
                    None
                } else {
                    let reason = "stream ended without a terminal event".to_string();
                    self.run.fail(&RagError::GenerationFailure(reason.clone()));
                    Some(StreamEvent::Failed(reason))
                }
            }
        }
    }

    /// Drains the remaining events and waits for the producer to exit.
    pub async fn finish(mut self) -> StreamOutcome {
        while self.next().await.is_some() {}
        match self.producer.take() {
            Some(producer) => match producer.await {
                Ok(outcome) => outcome,
                Err(err) => StreamOutcome::Failed(err.to_string()),
            },
            None => StreamOutcome::Cancelled,
        }
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Assembles a [`RagPipeline`] from settings and engine handles.
pub struct RagPipelineBuilder {
    settings: AppSettings,
    embedder: Option<Arc<dyn EmbeddingEngine>>,
    generator: Option<Arc<dyn GenerativeEngine>>,
    rewrite_engine: Option<Arc<dyn GenerativeEngine>>,
    rerank_engine: Option<Arc<dyn RerankEngine>>,
    store: Option<Arc<dyn RagStore>>,
}

impl RagPipelineBuilder {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings,
            embedder: None,
            generator: None,
            rewrite_engine: None,
            rerank_engine: None,
            store: None,
        }
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingEngine>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Generative engine for answers, and for rewrites unless
    /// [`Self::rewrite_engine`] overrides it.
    pub fn generator(mut self, generator: Arc<dyn GenerativeEngine>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn rewrite_engine(mut self, engine: Arc<dyn GenerativeEngine>) -> Self {
        self.rewrite_engine = Some(engine);
        self
    }

    pub fn rerank_engine(mut self, engine: Arc<dyn RerankEngine>) -> Self {
        self.rerank_engine = Some(engine);
        self
    }

    pub fn store(mut self, store: Arc<dyn RagStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<RagPipeline, RagError> {
        let settings = self.settings;
        let embedder = self
            .embedder
            .ok_or_else(|| RagError::InvalidConfig("an embedding engine is required".to_string()))?;
        let generator = self
            .generator
            .ok_or_else(|| RagError::InvalidConfig("a generative engine is required".to_string()))?;
        let rewrite_engine = self.rewrite_engine.unwrap_or_else(|| generator.clone());

        let rerank_engine: Arc<dyn RerankEngine> = match (self.rerank_engine, settings.rerank.engine) {
            (Some(engine), _) => engine,
            (None, RerankEngineKind::Hybrid) => Arc::new(HybridRerankEngine::new(
                embedder.clone(),
                settings.rerank.keyword_weight,
            )),
            (None, RerankEngineKind::Keyword) => Arc::new(KeywordRerankEngine::new()),
            (None, RerankEngineKind::Http) => {
                return Err(RagError::InvalidConfig(
                    "rerank.engine = \"http\" needs a rerank engine handle".to_string(),
                ))
            }
        };
        let store = self.store.unwrap_or_else(|| {
            Arc::new(MemoryRagStore::new(settings.index.collection_name.clone())) as Arc<dyn RagStore>
        });

        if settings.retrieval.k == 0 {
            return Err(RagError::InvalidConfig("retrieval.k must be at least 1".to_string()));
        }
        if settings.rerank.top_n == 0 {
            return Err(RagError::InvalidConfig("rerank.top_n must be at least 1".to_string()));
        }

        let timeouts = &settings.timeouts;
        Ok(RagPipeline {
            chunker: Chunker::new(settings.chunking.chunk_size, settings.chunking.chunk_overlap)?,
            index: VectorIndex::new(embedder, store, timeouts.embed()),
            rewriter: QueryRewriter::new(rewrite_engine, timeouts.rewrite())
                .with_enabled(settings.rewrite.enabled),
            reranker: Reranker::new(rerank_engine, timeouts.rerank()),
            generator: AnswerGenerator::new(generator, timeouts.generate())
                .with_stream_buffer(settings.generation.stream_buffer),
            context_builder: ContextBuilder::new(ContextBuilderConfig::from(&settings.context)),
            retrieval_k: settings.retrieval.k,
            rerank_top_n: settings.rerank.top_n,
            rerank_fallback: settings.rerank.fallback,
        })
    }
}
