use std::sync::Arc;

use crate::core::config::{AppPaths, AppSettings, ConfigService, EmbeddingProvider, RerankEngineKind};
use crate::llm::{
    EmbeddingEngine, GenerativeEngine, HashingEmbedder, OpenAiCompatProvider, RerankEngine,
};
use crate::rag::{MemoryRagStore, RagPipeline, RagStore, SqliteRagStore};

pub mod error;

use error::InitializationError;

/// Application state shared across all routes.
///
/// Engines and the vector index are built once at startup and reached only
/// through the pipeline handle; request handlers never construct services.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: ConfigService,
    pub settings: Arc<AppSettings>,
    pub pipeline: Arc<RagPipeline>,
}

impl AppState {
    /// Initializes the application state.
    ///
    /// This process includes:
    /// 1. Resolving paths and loading the validated settings
    /// 2. Building the engine adapters named in `engines`
    /// 3. Opening the persistent or in-memory passage store
    /// 4. Assembling the RAG pipeline
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        Self::initialize_with(Arc::new(AppPaths::new())).await
    }

    pub async fn initialize_with(paths: Arc<AppPaths>) -> Result<Arc<Self>, InitializationError> {
        let config = ConfigService::new(paths.clone());
        let settings = config
            .load_settings()
            .map_err(|e| InitializationError::Config(e.into()))?;

        let provider = Arc::new(OpenAiCompatProvider::new(&settings.engines));
        let generator: Arc<dyn GenerativeEngine> = provider.clone();
        let reranker: Option<Arc<dyn RerankEngine>> = match settings.rerank.engine {
            RerankEngineKind::Http => Some(provider.clone() as Arc<dyn RerankEngine>),
            RerankEngineKind::Hybrid | RerankEngineKind::Keyword => None,
        };
        let embedder: Arc<dyn EmbeddingEngine> = match settings.engines.embedding_provider {
            EmbeddingProvider::OpenAi => provider,
            EmbeddingProvider::Hashing => {
                Arc::new(HashingEmbedder::new(settings.engines.hashing_dimensions))
            }
        };

        let store = open_store(&paths, &settings).await?;
        tracing::info!(
            collection = store.collection(),
            persistent = store.is_persistent(),
            embedder = embedder.name(),
            generator = generator.name(),
            rerank = ?settings.rerank.engine,
            "RAG services ready"
        );

        let mut builder = RagPipeline::builder(settings.clone())
            .embedder(embedder)
            .generator(generator)
            .store(store);
        if let Some(reranker) = reranker {
            builder = builder.rerank_engine(reranker);
        }
        let pipeline = builder
            .build()
            .map_err(|e| InitializationError::Pipeline(e.into()))?;

        Ok(Self::from_parts(paths, config, settings, pipeline))
    }

    /// Wraps pre-built services, e.g. a pipeline wired to stub engines.
    pub fn from_parts(
        paths: Arc<AppPaths>,
        config: ConfigService,
        settings: AppSettings,
        pipeline: RagPipeline,
    ) -> Arc<Self> {
        Arc::new(AppState {
            paths,
            config,
            settings: Arc::new(settings),
            pipeline: Arc::new(pipeline),
        })
    }
}

async fn open_store(
    paths: &AppPaths,
    settings: &AppSettings,
) -> Result<Arc<dyn RagStore>, InitializationError> {
    let collection = settings.index.collection_name.as_str();
    if !settings.index.persistent {
        return Ok(Arc::new(MemoryRagStore::new(collection)));
    }

    let directory = settings
        .index
        .persist_directory
        .clone()
        .unwrap_or_else(|| paths.vector_store_dir.clone());
    let store = SqliteRagStore::open(&directory, collection)
        .await
        .map_err(|e| InitializationError::Rag(e.into()))?;
    tracing::debug!(path = %store.db_path().display(), "opened passage database");
    Ok(Arc::new(store))
}
