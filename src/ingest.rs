//! Ingestion pipeline orchestration.
//!
//! Coordinates one run: crawl → analyze → chunk → diff against the stores →
//! embed → write. The diff is by chunk id, so unchanged chunks are never
//! re-embedded or rewritten and their `ingested_at` survives re-ingestion.
//!
//! Write order keeps the two stores referentially safe for readers running
//! concurrently: metadata is written before the vectors that point at it,
//! and vectors are deleted before the metadata they point at. A vector hit
//! therefore never lacks its record except after external damage, which the
//! retriever tolerates.
//!
//! | Mode | Artifacts reprocessed | Removed paths | Missing vectors |
//! |------|-----------------------|---------------|-----------------|
//! | `Incremental` | new or checksum-changed | deleted | left alone |
//! | `Full` | all | deleted | re-embedded |

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::analyzer::analyze;
use crate::chunk::Chunker;
use crate::config::{Config, RepositoryConfig};
use crate::crawler::Crawler;
use crate::embedding::Embedder;
use crate::error::{EmbeddingServiceError, IngestionError};
use crate::metadata_store::MetadataStore;
use crate::models::{ArtifactRecord, Chunk, MetadataRecord, RepositoryArtifact};
use crate::progress::{IngestProgressEvent, NoProgress, ProgressReporter};
use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    Full,
    Incremental,
}

/// What one ingest run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    /// Readable text artifacts found by the crawler.
    pub artifacts_seen: usize,
    pub artifacts_processed: usize,
    /// Processed or skipped artifacts whose chunks were already stored.
    pub artifacts_unchanged: usize,
    pub artifacts_removed: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub chunks_unchanged: usize,
    /// Vectors re-created for stored chunks that had none (full mode).
    pub embeddings_repaired: usize,
    /// Vectors with no metadata record, deleted (full mode).
    pub orphans_removed: usize,
    #[serde(skip)]
    pub failures: Vec<IngestionError>,
}

pub struct Ingestor {
    vectors: Arc<VectorStore>,
    metadata: Arc<MetadataStore>,
    embedder: Arc<dyn Embedder>,
    repository: RepositoryConfig,
    chunker: Chunker,
    workers: usize,
    progress: Arc<dyn ProgressReporter>,
}

/// One artifact after analysis, ready to diff.
struct Prepared {
    artifact: RepositoryArtifact,
    chunks: Vec<Chunk>,
}

impl Ingestor {
    pub fn new(
        vectors: Arc<VectorStore>,
        metadata: Arc<MetadataStore>,
        embedder: Arc<dyn Embedder>,
        config: &Config,
    ) -> Self {
        Self {
            vectors,
            metadata,
            embedder,
            repository: config.repository.clone(),
            chunker: Chunker::new(&config.chunking),
            workers: config.ingest.workers.max(1),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Bring both stores in line with the repository at `root`.
    ///
    /// Per-artifact read and analysis failures are collected in the report
    /// and never abort the run; their previously stored chunks are kept.
    /// An embedding service failure aborts the run after flushing whatever
    /// was already written, leaving every artifact either fully old or
    /// fully new.
    pub async fn ingest(&self, root: &Path, mode: IngestMode) -> Result<IngestReport> {
        let result = self.run(root, mode).await;
        self.vectors.flush().await?;
        let report = result?;

        tracing::info!(
            mode = ?mode,
            seen = report.artifacts_seen,
            processed = report.artifacts_processed,
            removed = report.artifacts_removed,
            chunks_added = report.chunks_added,
            chunks_removed = report.chunks_removed,
            failures = report.failures.len(),
            "ingest finished"
        );
        Ok(report)
    }

    async fn run(&self, root: &Path, mode: IngestMode) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        self.progress.report(IngestProgressEvent::Discovering {
            root: root.display().to_string(),
        });
        let crawler = Crawler::new(root, &self.repository)?;
        let outcome = tokio::task::spawn_blocking(move || crawler.crawl_all()).await?;
        report.artifacts_seen = outcome.artifacts.len();
        report.failures = outcome.failures;

        let stored: HashMap<String, ArtifactRecord> = self
            .metadata
            .artifacts()
            .await?
            .into_iter()
            .map(|a| (a.path.clone(), a))
            .collect();
        let seen: HashSet<String> = outcome.artifacts.iter().map(|a| a.path.clone()).collect();

        let to_process: Vec<RepositoryArtifact> = outcome
            .artifacts
            .into_iter()
            .filter(|artifact| {
                let unchanged = mode == IngestMode::Incremental
                    && stored
                        .get(&artifact.path)
                        .is_some_and(|s| s.checksum == artifact.checksum);
                if unchanged {
                    report.artifacts_unchanged += 1;
                }
                !unchanged
            })
            .collect();

        let prepared = self.prepare(to_process, &mut report.failures).await;
        let total = prepared.len() as u64;
        for (n, item) in prepared.into_iter().enumerate() {
            self.apply(item, mode, &stored, &mut report).await?;
            self.progress.report(IngestProgressEvent::Ingesting {
                n: n as u64 + 1,
                total,
            });
        }

        self.remove_deleted(&stored, &seen, &mut report).await?;
        if mode == IngestMode::Full {
            self.remove_orphans(&mut report).await?;
        }
        Ok(report)
    }

    /// Analyze and chunk on the blocking pool, `workers` at a time, then
    /// restore path order so writes are deterministic.
    async fn prepare(
        &self,
        artifacts: Vec<RepositoryArtifact>,
        failures: &mut Vec<IngestionError>,
    ) -> Vec<Prepared> {
        let chunker = self.chunker;
        let results: Vec<Result<Prepared, IngestionError>> = stream::iter(artifacts)
            .map(|artifact| {
                let path = artifact.path.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let analyzed = analyze(&artifact);
                        let chunks = chunker.chunk(&analyzed);
                        Prepared { artifact, chunks }
                    })
                    .await
                    .map_err(|e| IngestionError::new(&path, format!("analysis failed: {}", e)))
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut prepared = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(item) => prepared.push(item),
                Err(err) => {
                    tracing::warn!(path = %err.path.display(), error = %err.reason, "skipping artifact");
                    failures.push(err);
                }
            }
        }
        prepared.sort_by(|a, b| a.artifact.path.cmp(&b.artifact.path));
        prepared
    }

    async fn apply(
        &self,
        item: Prepared,
        mode: IngestMode,
        stored: &HashMap<String, ArtifactRecord>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let Prepared { artifact, chunks } = item;
        report.artifacts_processed += 1;

        let existing: HashSet<String> = self
            .metadata
            .chunk_ids_for_path(&artifact.path)
            .await?
            .into_iter()
            .collect();
        let current: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();

        let added: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| !existing.contains(&c.id))
            .collect();
        let mut stale: Vec<String> = existing
            .iter()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        stale.sort();
        let repairs: Vec<&Chunk> = if mode == IngestMode::Full {
            chunks
                .iter()
                .filter(|c| existing.contains(&c.id) && !self.vectors.contains(&c.id))
                .collect()
        } else {
            Vec::new()
        };
        let unchanged = chunks.len() - added.len();
        report.chunks_unchanged += unchanged;

        let row_current = stored.get(&artifact.path).is_some_and(|s| {
            s.checksum == artifact.checksum && s.chunk_count == chunks.len() as i64
        });
        if added.is_empty() && stale.is_empty() && repairs.is_empty() && row_current {
            report.artifacts_unchanged += 1;
            return Ok(());
        }

        // Embed before touching either store so a service failure leaves
        // this artifact exactly as it was.
        let to_embed: Vec<&Chunk> = added.iter().chain(repairs.iter()).copied().collect();
        let texts: Vec<String> = to_embed.iter().map(|c| c.text.clone()).collect();
        let embeddings = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        if embeddings.len() != to_embed.len() {
            return Err(EmbeddingServiceError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                to_embed.len(),
                embeddings.len()
            ))
            .into());
        }
        if let Some(bad) = embeddings.iter().find(|v| v.len() != self.vectors.dims()) {
            return Err(EmbeddingServiceError::Dimension {
                expected: self.vectors.dims(),
                actual: bad.len(),
            }
            .into());
        }

        let now = chrono::Utc::now().timestamp();
        let records: Vec<MetadataRecord> = added
            .iter()
            .map(|c| MetadataRecord::from_chunk(c, now))
            .collect();
        let artifact_record = ArtifactRecord {
            path: artifact.path.clone(),
            kind: artifact.kind,
            language: artifact.language.clone(),
            checksum: artifact.checksum.clone(),
            size_bytes: artifact.size_bytes as i64,
            chunk_count: chunks.len() as i64,
            ingested_at: now,
        };

        for id in &stale {
            self.vectors.delete(id);
        }
        self.metadata
            .replace_artifact(&artifact_record, &stale, &records)
            .await?;
        for (chunk, embedding) in to_embed.iter().zip(embeddings) {
            self.vectors.upsert(&chunk.id, embedding, now)?;
        }

        tracing::debug!(
            path = %artifact.path,
            added = added.len(),
            removed = stale.len(),
            unchanged,
            repaired = repairs.len(),
            "ingested artifact"
        );
        report.chunks_added += added.len();
        report.chunks_removed += stale.len();
        report.embeddings_repaired += repairs.len();
        Ok(())
    }

    /// Drop stored artifacts the crawl no longer found. Paths under a read
    /// failure are kept: an unreadable file is not a deleted file.
    async fn remove_deleted(
        &self,
        stored: &HashMap<String, ArtifactRecord>,
        seen: &HashSet<String>,
        report: &mut IngestReport,
    ) -> Result<()> {
        let protected: Vec<String> = report
            .failures
            .iter()
            .map(|f| f.path.to_string_lossy().replace('\\', "/"))
            .collect();
        let is_protected = |path: &str| {
            protected.iter().any(|p| {
                p.is_empty()
                    || path == p
                    || path
                        .strip_prefix(p.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        };

        let mut removed: Vec<&String> = stored
            .keys()
            .filter(|path| !seen.contains(*path) && !is_protected(path))
            .collect();
        removed.sort();
        if removed.is_empty() {
            return Ok(());
        }

        self.progress.report(IngestProgressEvent::Removing {
            count: removed.len() as u64,
        });
        for path in removed {
            let ids = self.metadata.chunk_ids_for_path(path).await?;
            for id in &ids {
                self.vectors.delete(id);
            }
            let deleted = self.metadata.delete_artifact(path).await?;
            tracing::debug!(path = %path, chunks = deleted.len(), "removed deleted artifact");
            report.chunks_removed += deleted.len();
            report.artifacts_removed += 1;
        }
        Ok(())
    }

    async fn remove_orphans(&self, report: &mut IngestReport) -> Result<()> {
        let known: HashSet<String> = self.metadata.all_chunk_ids().await?.into_iter().collect();
        for id in self.vectors.chunk_ids() {
            if !known.contains(&id) && self.vectors.delete(&id) {
                tracing::warn!(chunk_id = %id, "removed vector with no metadata record");
                report.orphans_removed += 1;
            }
        }
        Ok(())
    }
}
