//! Session handle owning the stores, caches and services.
//!
//! `Engine` is the only place where the pieces are constructed. The
//! [`Ingestor`] and [`ContextRetriever`] receive shared handles from it, so
//! ingestion and queries can run concurrently against one engine.

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;

use crate::cache::{Cache, CacheStats};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::ingest::{IngestMode, IngestReport, Ingestor};
use crate::metadata_store::{MetadataFilter, MetadataStore};
use crate::models::RetrievalResult;
use crate::progress::{NoProgress, ProgressReporter};
use crate::retrieve::{ContextRetriever, EmbeddingCache, QueryCache};
use crate::vector_store::VectorStore;

pub struct Engine {
    config: Config,
    vectors: Arc<VectorStore>,
    metadata: Arc<MetadataStore>,
    embedder: Arc<dyn Embedder>,
    retriever: ContextRetriever,
    query_cache: Arc<QueryCache>,
    progress: Arc<dyn ProgressReporter>,
    /// One ingestion at a time per engine.
    ingest_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Open (or create) the stores under `config.storage.root`.
    ///
    /// Fails with an [`IndexCorruptionError`](crate::error::IndexCorruptionError)
    /// if the persisted vector index cannot be read. An index built with a
    /// different dimensionality or metric than configured is a plain error
    /// asking for a rebuild.
    pub async fn open(config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        if embedder.dims() != config.embedding.dims {
            bail!(
                "embedder '{}' produces {} dimensions but embedding.dims is {}",
                embedder.model_name(),
                embedder.dims(),
                config.embedding.dims
            );
        }

        let vectors = Arc::new(VectorStore::open(
            config.storage.vector_index_path(),
            config.embedding.dims,
            config.index.metric,
        )?);
        let metadata = Arc::new(MetadataStore::open(&config.storage.metadata_path()).await?);

        let embedding_cache: Arc<EmbeddingCache> =
            Arc::new(Cache::new(config.cache.capacity, config.cache.ttl()));
        let query_cache: Arc<QueryCache> =
            Arc::new(Cache::new(config.cache.capacity, config.cache.ttl()));
        let retriever = ContextRetriever::new(
            Arc::clone(&vectors),
            Arc::clone(&metadata),
            Arc::clone(&embedder),
            embedding_cache,
            Arc::clone(&query_cache),
            config.retrieval.clone(),
        );

        tracing::debug!(
            root = %config.storage.root.display(),
            vectors = vectors.len(),
            model = embedder.model_name(),
            "engine opened"
        );

        Ok(Self {
            config,
            vectors,
            metadata,
            embedder,
            retriever,
            query_cache,
            progress: Arc::new(NoProgress),
            ingest_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Open with the embedder selected by `embedding.provider`.
    pub async fn open_with_config(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        Self::open(config, embedder).await
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn retriever(&self) -> &ContextRetriever {
        &self.retriever
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            Arc::clone(&self.vectors),
            Arc::clone(&self.metadata),
            Arc::clone(&self.embedder),
            &self.config,
        )
        .with_progress(Arc::clone(&self.progress))
    }

    pub async fn ingest(&self, root: &Path, mode: IngestMode) -> Result<IngestReport> {
        let _guard = self.ingest_lock.lock().await;
        let report = self.ingestor().ingest(root, mode).await?;
        // Generation keys already make old results unreachable; dropping
        // them frees the memory.
        self.query_cache.clear();
        Ok(report)
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<RetrievalResult> {
        self.retriever.retrieve(query, top_k, filters).await
    }

    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        (
            self.retriever.embedding_cache_stats(),
            self.retriever.query_cache_stats(),
        )
    }

    /// Persist the vector index and close the database pool.
    pub async fn close(&self) -> Result<()> {
        self.vectors.flush().await?;
        self.metadata.close().await;
        Ok(())
    }
}
