//! Query-time retrieval: embed the question, search the vector index,
//! resolve and filter metadata, rank, and cache the answer.

use anyhow::Result;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{embedding_key, query_key, Cache, CacheStats};
use crate::config::RetrievalConfig;
use crate::embedding::{embed_one, Embedder};
use crate::error::{unwrap_cache_error, DanglingReference, EmbeddingServiceError};
use crate::metadata_store::{MetadataFilter, MetadataStore};
use crate::models::{RetrievalResult, ScoredChunk};
use crate::query::analyze_query;
use crate::vector_store::VectorStore;

pub type EmbeddingCache = Cache<String, Arc<Vec<f32>>>;
pub type QueryCache = Cache<String, RetrievalResult>;

pub struct ContextRetriever {
    vectors: Arc<VectorStore>,
    metadata: Arc<MetadataStore>,
    embedder: Arc<dyn Embedder>,
    embedding_cache: Arc<EmbeddingCache>,
    query_cache: Arc<QueryCache>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(
        vectors: Arc<VectorStore>,
        metadata: Arc<MetadataStore>,
        embedder: Arc<dyn Embedder>,
        embedding_cache: Arc<EmbeddingCache>,
        query_cache: Arc<QueryCache>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            vectors,
            metadata,
            embedder,
            embedding_cache,
            query_cache,
            config,
        }
    }

    pub fn embedding_cache_stats(&self) -> CacheStats {
        self.embedding_cache.stats()
    }

    pub fn query_cache_stats(&self) -> CacheStats {
        self.query_cache.stats()
    }

    /// Up to `top_k` chunks ranked by relevance to `query`, restricted to
    /// records matching `filters`.
    ///
    /// An empty result is a valid answer. Errors are limited to embedding
    /// failures and storage I/O.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: &MetadataFilter,
    ) -> Result<RetrievalResult> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(RetrievalResult::default());
        }

        let key = query_key(
            query,
            top_k,
            filters,
            self.vectors.generation(),
            self.metadata.generation(),
        );
        if let Some(cached) = self.query_cache.get(&key) {
            tracing::debug!(query, "query cache hit");
            return Ok(cached);
        }

        let embedding = self.embed_query(query).await?;
        let analysis = analyze_query(query);

        let mut fetch = top_k.saturating_mul(self.config.overfetch_factor.max(1));
        let mut seen_dangling = HashSet::new();
        let survivors = loop {
            let candidates = self.vectors.query(&embedding, fetch)?;
            let ids: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();
            let mut records = self.metadata.get_many(&ids).await?;

            let mut survivors = Vec::with_capacity(candidates.len());
            for (chunk_id, distance) in &candidates {
                let Some(record) = records.remove(chunk_id) else {
                    if seen_dangling.insert(chunk_id.clone()) {
                        let err = DanglingReference {
                            chunk_id: chunk_id.clone(),
                        };
                        tracing::warn!(chunk_id = %chunk_id, "{}", err);
                    }
                    continue;
                };
                if !filters.matches(&record) {
                    continue;
                }

                let similarity = self.vectors.metric().similarity(*distance);
                let boosted = record.symbols.iter().any(|s| analysis.names_symbol(s));
                let score = if boosted {
                    similarity + self.config.symbol_boost
                } else {
                    similarity
                };
                survivors.push(ScoredChunk {
                    record,
                    score,
                    similarity,
                });
            }

            // A filter can reject every overfetched candidate while matches
            // remain further down the index; widen until the index runs out.
            let exhausted = candidates.len() < fetch;
            if filters.is_empty() || survivors.len() >= top_k || exhausted {
                break survivors;
            }
            fetch = fetch.saturating_mul(2);
        };

        let mut hits = survivors;
        hits.sort_by(rank);
        hits.truncate(top_k);

        tracing::debug!(query, hits = hits.len(), "retrieved context");
        let result = RetrievalResult { hits };
        self.query_cache.insert(key, result.clone());
        Ok(result)
    }

    async fn embed_query(&self, query: &str) -> Result<Arc<Vec<f32>>> {
        let key = embedding_key(self.embedder.model_name(), query);
        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();

        let embedding = self
            .embedding_cache
            .get_or_compute(key, move || async move {
                let vector = embed_one(embedder.as_ref(), &text).await?;
                Ok(Arc::new(vector))
            })
            .await
            .map_err(unwrap_cache_error)?;

        if embedding.len() != self.vectors.dims() {
            return Err(EmbeddingServiceError::Dimension {
                expected: self.vectors.dims(),
                actual: embedding.len(),
            }
            .into());
        }
        Ok(embedding)
    }
}

/// Score descending, then most recently ingested, then chunk id.
fn rank(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.record.ingested_at.cmp(&a.record.ingested_at))
        .then_with(|| a.record.chunk_id.cmp(&b.record.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{ArtifactKind, MetadataRecord};
    use crate::vector_store::Metric;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    const DIMS: usize = 64;

    struct CountingEmbedder {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }

        fn dims(&self) -> usize {
            DIMS
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }

        fn dims(&self) -> usize {
            DIMS
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(EmbeddingServiceError::Request("connection refused".into()).into())
        }
    }

    fn record(id: &str, path: &str, text: &str, symbols: &[&str], ingested_at: i64) -> MetadataRecord {
        MetadataRecord {
            chunk_id: id.to_string(),
            path: path.to_string(),
            start_line: 1,
            end_line: 10,
            kind: if path.ends_with(".md") {
                ArtifactKind::Doc
            } else {
                ArtifactKind::Code
            },
            language: "rust".to_string(),
            parent_symbol: symbols.first().map(|s| s.to_string()),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            env_vars: vec![],
            checksum: id.to_string(),
            artifact_checksum: "a".to_string(),
            char_len: text.chars().count() as i64,
            text: text.to_string(),
            ingested_at,
        }
    }

    struct Fixture {
        _tmp: TempDir,
        vectors: Arc<VectorStore>,
        metadata: Arc<MetadataStore>,
    }

    async fn fixture(records: &[MetadataRecord]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let vectors =
            Arc::new(VectorStore::open(tmp.path().join("vectors.idx"), DIMS, Metric::Cosine).unwrap());
        let metadata = Arc::new(
            MetadataStore::open(&tmp.path().join("metadata.sqlite"))
                .await
                .unwrap(),
        );
        let embedder = HashEmbedder::new(DIMS);
        for r in records {
            metadata.put(r).await.unwrap();
            vectors
                .upsert(&r.chunk_id, embedder.embed_text(&r.text), r.ingested_at)
                .unwrap();
        }
        Fixture {
            _tmp: tmp,
            vectors,
            metadata,
        }
    }

    fn retriever(f: &Fixture, embedder: Arc<dyn Embedder>) -> ContextRetriever {
        ContextRetriever::new(
            Arc::clone(&f.vectors),
            Arc::clone(&f.metadata),
            embedder,
            Arc::new(Cache::new(64, None)),
            Arc::new(Cache::new(64, None)),
            RetrievalConfig::default(),
        )
    }

    fn sample() -> Vec<MetadataRecord> {
        vec![
            record("a", "src/pool.rs", "fn connect_pool(url: &str) -> Pool", &["connect_pool"], 10),
            record("b", "src/http.rs", "fn serve_http(addr: SocketAddr)", &["serve_http"], 10),
            record("c", "README.md", "Install with cargo and run the server", &[], 10),
        ]
    }

    #[tokio::test]
    async fn test_blank_query_and_zero_top_k_are_empty() {
        let f = fixture(&sample()).await;
        let r = retriever(&f, Arc::new(HashEmbedder::new(DIMS)));
        assert!(r.retrieve("   ", 5, &MetadataFilter::default()).await.unwrap().is_empty());
        assert!(r.retrieve("connect", 0, &MetadataFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_symbol_query_ranks_defining_chunk_first() {
        let f = fixture(&sample()).await;
        let r = retriever(&f, Arc::new(HashEmbedder::new(DIMS)));
        let result = r
            .retrieve("where is connect_pool", 3, &MetadataFilter::default())
            .await
            .unwrap();
        let top = result.top().unwrap();
        assert_eq!(top.record.path, "src/pool.rs");
        assert!(top.score > top.similarity);
    }

    #[tokio::test]
    async fn test_filters_exclude_and_zero_match_is_empty() {
        let f = fixture(&sample()).await;
        let r = retriever(&f, Arc::new(HashEmbedder::new(DIMS)));

        let docs_only = MetadataFilter {
            kind: Some(ArtifactKind::Doc),
            ..Default::default()
        };
        let result = r.retrieve("connect_pool", 3, &docs_only).await.unwrap();
        assert_eq!(result.chunk_ids(), vec!["c"]);

        let nothing = MetadataFilter {
            language: Some("cobol".into()),
            ..Default::default()
        };
        assert!(r.retrieve("connect_pool", 3, &nothing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dangling_reference_is_dropped() {
        let f = fixture(&sample()).await;
        f.metadata.delete("a").await.unwrap();
        let r = retriever(&f, Arc::new(HashEmbedder::new(DIMS)));

        let result = r
            .retrieve("connect_pool", 3, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert!(!result.chunk_ids().contains(&"a"));
    }

    #[tokio::test]
    async fn test_repeat_query_hits_caches() {
        let f = fixture(&sample()).await;
        let embedder = Arc::new(CountingEmbedder {
            inner: HashEmbedder::new(DIMS),
            calls: AtomicUsize::new(0),
        });
        let r = retriever(&f, embedder.clone());

        let first = r.retrieve("serve_http", 2, &MetadataFilter::default()).await.unwrap();
        let second = r.retrieve("serve_http", 2, &MetadataFilter::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(r.query_cache_stats().hits, 1);

        // a write bumps the generation, so the result is recomputed but the
        // query embedding is reused
        f.vectors.delete("c");
        let third = r.retrieve("serve_http", 2, &MetadataFilter::default()).await.unwrap();
        assert_eq!(third.top().unwrap().record.chunk_id, "b");
        assert_eq!(embedder.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metadata_writes_invalidate_cached_results() {
        let f = fixture(&sample()).await;
        let r = retriever(&f, Arc::new(HashEmbedder::new(DIMS)));

        let before = r
            .retrieve("connect_pool", 3, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(before.top().unwrap().record.chunk_id, "a");

        f.metadata.delete("a").await.unwrap();
        let after = r
            .retrieve("connect_pool", 3, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(!after.chunk_ids().contains(&"a"));

        // a rewritten record that no longer matches the filter drops out
        let rust_only = MetadataFilter {
            language: Some("rust".into()),
            ..Default::default()
        };
        let rust = r.retrieve("serve_http", 3, &rust_only).await.unwrap();
        assert!(rust.chunk_ids().contains(&"b"));
        let mut moved = sample().remove(1);
        moved.language = "go".to_string();
        f.metadata.put(&moved).await.unwrap();
        let rust = r.retrieve("serve_http", 3, &rust_only).await.unwrap();
        assert!(!rust.chunk_ids().contains(&"b"));
        assert_eq!(r.query_cache_stats().hits, 0);
    }

    #[tokio::test]
    async fn test_ties_break_by_recency_then_id() {
        let records = vec![
            record("x2", "src/a.rs", "same text", &[], 5),
            record("x1", "src/b.rs", "same text", &[], 5),
            record("x3", "src/c.rs", "same text", &[], 9),
        ];
        let f = fixture(&records).await;
        let r = retriever(&f, Arc::new(HashEmbedder::new(DIMS)));
        let result = r.retrieve("same text", 3, &MetadataFilter::default()).await.unwrap();
        assert_eq!(result.chunk_ids(), vec!["x3", "x1", "x2"]);
    }

    #[tokio::test]
    async fn test_embedding_failure_keeps_its_type() {
        let f = fixture(&sample()).await;
        let r = retriever(&f, Arc::new(FailingEmbedder));
        let err = r
            .retrieve("connect_pool", 3, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<EmbeddingServiceError>().is_some());
    }
}
