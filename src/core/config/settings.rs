//! Typed application settings.
//!
//! Every field has a default so a missing or partial `config.yml` still
//! yields a usable configuration. Defaults follow the values the service
//! has always shipped with (chunk size 1000, overlap 200, top-3 rerank).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub server: ServerSettings,
    pub engines: EngineSettings,
    pub index: IndexSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub rerank: RerankSettings,
    pub rewrite: RewriteSettings,
    pub context: ContextSettings,
    pub generation: GenerationSettings,
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// `/v1/embeddings` on the configured OpenAI-compatible endpoint.
    OpenAi,
    /// Local feature-hashing embeddings, no network.
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    /// Model served at `/rerank` when `rerank.engine = "http"`.
    pub rerank_model: String,
    pub temperature: f64,
    pub embedding_provider: EmbeddingProvider,
    pub hashing_dimensions: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key: None,
            chat_model: "gemini-2.5-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
            rerank_model: "bge-reranker-v2-m3".to_string(),
            temperature: 0.1,
            embedding_provider: EmbeddingProvider::OpenAi,
            hashing_dimensions: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub collection_name: String,
    pub persistent: bool,
    /// Directory of the SQLite store; the data dir's `vector_store` when unset.
    pub persist_directory: Option<PathBuf>,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            collection_name: "rag_collection".to_string(),
            persistent: true,
            persist_directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Candidates fetched from the index before reranking.
    pub k: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { k: 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankEngineKind {
    /// Embedding similarity blended with query term coverage.
    Hybrid,
    /// Query term coverage only.
    Keyword,
    /// Cross-encoder behind the engine endpoint's `/rerank`.
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankFallback {
    /// Keep the first `top_n` candidates in retrieval order.
    RetrievalOrder,
    /// Fail the request.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    pub top_n: usize,
    pub engine: RerankEngineKind,
    pub fallback: RerankFallback,
    /// Share of the hybrid score taken by term coverage, in `0.0..=1.0`.
    pub keyword_weight: f32,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            top_n: 3,
            engine: RerankEngineKind::Hybrid,
            fallback: RerankFallback::RetrievalOrder,
            keyword_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteSettings {
    pub enabled: bool,
}

impl Default for RewriteSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub max_chars: usize,
    pub include_citations: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_chars: 8000,
            include_citations: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Capacity of the fragment channel between producer and consumer.
    pub stream_buffer: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self { stream_buffer: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub embed_ms: u64,
    pub rewrite_ms: u64,
    pub rerank_ms: u64,
    pub generate_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            embed_ms: 30_000,
            rewrite_ms: 15_000,
            rerank_ms: 15_000,
            generate_ms: 60_000,
        }
    }
}

impl TimeoutSettings {
    pub fn embed(&self) -> Duration {
        Duration::from_millis(self.embed_ms)
    }

    pub fn rewrite(&self) -> Duration {
        Duration::from_millis(self.rewrite_ms)
    }

    pub fn rerank(&self) -> Duration {
        Duration::from_millis(self.rerank_ms)
    }

    pub fn generate(&self) -> Duration {
        Duration::from_millis(self.generate_ms)
    }
}
