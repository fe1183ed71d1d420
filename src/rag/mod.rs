//! RAG (Retrieval-Augmented Generation) module.
//!
//! This module provides:
//! - `Chunker`: splits documents into overlapping passages
//! - `VectorIndex`: embeds passages into a `RagStore` and answers similarity queries
//! - `QueryRewriter`, `Reranker`, `AnswerGenerator`: the per-request stages
//! - `RagPipeline`: orchestrates ingest, search and (streaming) answers

pub mod chunker;
pub mod context_builder;
pub mod generator;
pub mod index;
pub mod memory;
pub mod pipeline;
pub mod reranker;
pub mod rewriter;
pub mod sqlite;
pub mod store;
pub mod types;

pub use chunker::Chunker;
pub use context_builder::{ContextBuilder, ContextBuilderConfig, RankedContext};
pub use generator::{AnswerGenerator, StreamEvent, StreamOutcome};
pub use index::VectorIndex;
pub use memory::MemoryRagStore;
pub use pipeline::{
    Answer, AnswerStream, DegradedStage, IngestReceipt, PipelineRun, PipelineStage, RagPipeline,
    RagPipelineBuilder, SearchHit,
};
pub use reranker::{HybridRerankEngine, KeywordRerankEngine, Reranker};
pub use rewriter::{QueryRewriter, Rewrite};
pub use sqlite::SqliteRagStore;
pub use store::RagStore;
pub use types::{Document, IndexStatus, Metadata, MetadataValue, NewPassage, Passage, ScoredPassage, SourceExcerpt};
