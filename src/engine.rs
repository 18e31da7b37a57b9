//! Composition root.
//!
//! [`Engine`] builds the whole query-side object graph from a [`Config`]:
//! store, caches, embedding service, query expander, hybrid search, and the
//! four repositories. Collaborator seams (chat client, WordNet, OCR,
//! embedder) are injectable so tests and alternative deployments can swap
//! them without touching the wiring.
//!
//! An engine holds one table snapshot for its lifetime: queries issued
//! against it stay consistent across a concurrent index build, and a
//! reopened engine observes the new snapshot. [`Engine::refresh`] reloads
//! the category index and drops cached search results after an in-process
//! rebuild.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder, EmbeddingService};
use crate::error::Result;
use crate::expand::{NoWordNet, QueryExpander, WordNetProvider};
use crate::llm::{ChatClient, HttpChatClient};
use crate::loader::OcrBackend;
use crate::pipeline::{IngestStats, PipelineDriver, PipelineOptions};
use crate::progress::{NoProgress, ProgressSink};
use crate::repo_catalog::CatalogRepository;
use crate::repo_categories::CategoryRepository;
use crate::repo_chunks::ChunkRepository;
use crate::repo_concepts::ConceptRepository;
use crate::search::HybridSearchService;
use crate::store::TableStore;

/// Injectable collaborator overrides. Any field left `None` falls back to
/// the configured default.
#[derive(Default)]
pub struct Collaborators {
    pub chat: Option<Arc<dyn ChatClient>>,
    pub wordnet: Option<Arc<dyn WordNetProvider>>,
    pub ocr: Option<Arc<dyn OcrBackend>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

pub struct Engine {
    pub config: Config,
    store: Arc<TableStore>,
    pub embeddings: Arc<EmbeddingService>,
    chat: Option<Arc<dyn ChatClient>>,
    ocr: Option<Arc<dyn OcrBackend>>,
    progress: Arc<dyn ProgressSink>,
    pub search: Arc<HybridSearchService>,
    pub catalog: Arc<CatalogRepository>,
    pub chunks: Arc<ChunkRepository>,
    pub concepts: Arc<ConceptRepository>,
    pub categories: Arc<CategoryRepository>,
}

impl Engine {
    /// Open with configured defaults.
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Collaborators::default()).await
    }

    /// Open with collaborator overrides.
    pub async fn open_with(config: Config, collaborators: Collaborators) -> Result<Self> {
        let store = Arc::new(TableStore::open(&config.database.url).await?);

        let embedder = match collaborators.embedder {
            Some(embedder) => embedder,
            None => create_embedder(
                &config.embedding,
                Duration::from_millis(config.resilience.embedding_timeout_ms),
            )?,
        };
        let embeddings = Arc::new(EmbeddingService::new(
            embedder,
            config.caches.embedding_capacity,
        ));

        let chat: Option<Arc<dyn ChatClient>> = match collaborators.chat {
            Some(chat) => Some(chat),
            None => match config.llm.api_key {
                Some(_) => Some(Arc::new(HttpChatClient::new(
                    &config.llm,
                    Duration::from_millis(config.resilience.llm_timeout_ms),
                )?)),
                None => None,
            },
        };

        let wordnet: Arc<dyn WordNetProvider> = collaborators
            .wordnet
            .unwrap_or_else(|| Arc::new(NoWordNet));
        let progress: Arc<dyn ProgressSink> = collaborators
            .progress
            .unwrap_or_else(|| Arc::new(NoProgress));

        let concepts = Arc::new(ConceptRepository::new(store.clone()));
        let expander = Arc::new(QueryExpander::new(
            wordnet,
            concepts.clone(),
            embeddings.clone(),
        ));
        let search = Arc::new(HybridSearchService::new(
            store.clone(),
            embeddings.clone(),
            expander,
            config.caches.search_capacity,
            Duration::from_millis(config.caches.search_ttl_ms),
        ));

        let catalog = Arc::new(CatalogRepository::new(
            store.clone(),
            search.clone(),
            config.retrieval.source_match_threshold,
        ));
        let chunks = Arc::new(ChunkRepository::new(
            store.clone(),
            search.clone(),
            catalog.clone(),
        ));
        let categories = Arc::new(CategoryRepository::open(store.clone()).await?);

        info!(db_root = %config.database.url.display(), "engine opened");
        Ok(Self {
            config,
            store,
            embeddings,
            chat,
            ocr: collaborators.ocr,
            progress,
            search,
            catalog,
            chunks,
            concepts,
            categories,
        })
    }

    /// Run the ingestion pipeline with this engine's collaborators, then
    /// refresh in-memory state to pick up the new snapshot.
    ///
    /// Requires a chat client (configured `llm.api_key` or an injected
    /// collaborator).
    pub async fn ingest(
        &self,
        source_dir: PathBuf,
        shutdown: watch::Receiver<bool>,
    ) -> Result<IngestStats> {
        let chat = self.chat.clone().ok_or_else(|| {
            crate::error::EngineError::Validation(
                "ingestion requires an LLM chat client (set llm.api_key)".to_string(),
            )
        })?;

        let driver = PipelineDriver::new(
            &self.config,
            chat,
            self.embeddings.clone(),
            self.ocr.clone(),
            self.progress.clone(),
        );
        let options = PipelineOptions::from_config(&self.config, source_dir);
        let stats = driver.run(&options, shutdown).await?;

        if !stats.cancelled {
            self.refresh().await?;
        }
        Ok(stats)
    }

    /// Reload the category index and drop cached search results.
    ///
    /// Queries running on this engine keep the snapshot it was opened on;
    /// reopen the engine to observe a post-build snapshot.
    pub async fn refresh(&self) -> Result<()> {
        self.categories.reload().await?;
        self.search.clear_cache().await;
        Ok(())
    }

    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }

    /// Release the database connection. Call on every exit path.
    pub async fn close(self) {
        let Engine {
            store,
            search,
            catalog,
            chunks,
            concepts,
            categories,
            ..
        } = self;
        // The repositories and the search service hold store handles; drop
        // them before unwrapping the last reference.
        drop(chunks);
        drop(catalog);
        drop(search);
        drop(concepts);
        drop(categories);
        if let Ok(store) = Arc::try_unwrap(store) {
            store.close().await;
        }
    }
}
