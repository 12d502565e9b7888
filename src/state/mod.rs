use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheBackend, ResponseCache, SqliteCacheBackend};
use crate::context::PromptComposer;
use crate::core::config::{service::redacted, AppPaths, ChatbotConfig, ConfigService, EmbeddingProvider};
use crate::embedding::{Embedder, HashingEmbedder, HttpEmbedder};
use crate::history::ConversationStore;
use crate::llm::{Generator, OpenAiCompatibleGenerator};
use crate::pipeline::{ChatPipeline, PipelineOptions};
use crate::rag::{ingest, DocumentIndex, Retriever};

pub mod error;

use error::InitializationError;

const EMBEDDING_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide services, built once at startup and shared by every request.
///
/// Providers are `init()`ed here and released by `shutdown()`; the pipeline
/// receives them by injection.
pub struct ChatbotServices {
    pub paths: Arc<AppPaths>,
    pub config: ChatbotConfig,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub index: Arc<DocumentIndex>,
    pub history: Arc<ConversationStore>,
    pub cache: Arc<ResponseCache>,
    pub pipeline: ChatPipeline,
    cache_backend: Option<Arc<SqliteCacheBackend>>,
}

impl ChatbotServices {
    /// Loads the config file for `paths`, then initializes everything.
    pub async fn start(paths: Arc<AppPaths>) -> Result<Arc<Self>, InitializationError> {
        let config = ConfigService::new(paths.clone())
            .load_config()
            .map_err(|e| InitializationError::Config(e.into()))?;
        tracing::debug!(config = %redacted(&config), "Effective configuration");
        Self::initialize(paths, config).await
    }

    /// Builds the configured providers, then wires the stores and pipeline.
    pub async fn initialize(
        paths: Arc<AppPaths>,
        config: ChatbotConfig,
    ) -> Result<Arc<Self>, InitializationError> {
        let embedding = &config.embedding;
        let embedder: Arc<dyn Embedder> = match embedding.provider {
            EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(
                embedding.dimension,
                embedding.input_policy(),
            )),
            EmbeddingProvider::Http => Arc::new(
                HttpEmbedder::new(
                    embedding.base_url.clone(),
                    embedding.model.clone(),
                    config.llm.api_key.clone(),
                    embedding.dimension,
                    embedding.input_policy(),
                    EMBEDDING_HTTP_TIMEOUT,
                )
                .map_err(|e| InitializationError::Embedder(e.into()))?,
            ),
        };

        let generator: Arc<dyn Generator> = Arc::new(
            OpenAiCompatibleGenerator::new(
                config.llm.base_url.clone(),
                config.llm.model.clone(),
                config.llm.api_key.clone(),
                Duration::from_millis(config.generation.timeout_ms),
            )
            .map_err(|e| InitializationError::Generator(e.into()))?,
        );

        Self::with_providers(paths, config, embedder, generator).await
    }

    /// Wires everything around already-built providers.
    pub async fn with_providers(
        paths: Arc<AppPaths>,
        config: ChatbotConfig,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Arc<Self>, InitializationError> {
        embedder
            .init()
            .await
            .map_err(|e| InitializationError::Embedder(e.into()))?;
        generator
            .init()
            .await
            .map_err(|e| InitializationError::Generator(e.into()))?;
        tracing::info!(
            embedder = embedder.name(),
            dimension = embedder.dimension(),
            generator = generator.name(),
            "Providers ready"
        );

        let history = Arc::new(
            ConversationStore::open(&paths.db_path)
                .await
                .map_err(|e| InitializationError::History(e.into()))?,
        );

        let cache_backend = match SqliteCacheBackend::open(&paths.db_path).await {
            Ok(backend) => {
                // The capacity may have shrunk since the last run.
                match backend.prune(config.cache.capacity.max(1)).await {
                    Ok(pruned) => tracing::info!(
                        pruned,
                        entries = backend.row_count().await.unwrap_or_default(),
                        "Durable response cache opened"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Failed to prune durable response cache"),
                }
                Some(Arc::new(backend))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Durable response cache unavailable, using memory only");
                None
            }
        };
        let cache = Arc::new(ResponseCache::new(
            config.cache.capacity,
            config.cache.shards,
            cache_backend
                .clone()
                .map(|b| b as Arc<dyn CacheBackend>),
        ));

        let index = Arc::new(DocumentIndex::new(embedder.dimension()));
        ingest::load_clinic_documents(&config.ingest, embedder.as_ref(), &index)
            .await
            .map_err(|e| InitializationError::Documents(e.into()))?;
        if index.is_empty() {
            tracing::warn!("Document index is empty; answers will have no clinic context");
        }

        let retriever = Retriever::new(
            embedder.clone(),
            index.clone(),
            config.retrieval.per_category,
        );
        let composer = PromptComposer::new(
            config.prompt.system_prompt.clone(),
            config.history.window,
            config.generation.parameters(),
        );
        let pipeline = ChatPipeline::new(
            retriever,
            history.clone(),
            cache.clone(),
            composer,
            generator.clone(),
            PipelineOptions::from_config(&config),
        );

        Ok(Arc::new(Self {
            paths,
            config,
            embedder,
            generator,
            index,
            history,
            cache,
            pipeline,
            cache_backend,
        }))
    }

    pub async fn shutdown(&self) {
        self.generator.shutdown().await;
        self.embedder.shutdown().await;
        self.history.close().await;
        if let Some(backend) = &self.cache_backend {
            backend.close().await;
        }
        tracing::info!("Services shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_config_file_stops_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yml"), "cache:\n  size: 10\n").unwrap();
        let paths = Arc::new(AppPaths::with_data_dir(dir.path()));

        let err = match ChatbotServices::start(paths).await {
            Ok(_) => panic!("startup should fail on an unknown config key"),
            Err(err) => err,
        };

        assert!(matches!(err, InitializationError::Config(_)));
        assert!(err.to_string().contains("cache.size"));
    }
}
