//! Persisted embedding index with exact nearest-neighbour search.
//!
//! Vectors live in memory behind an `RwLock` and are written to a single
//! file by [`VectorStore::flush`] (temp file + rename, so a crash never
//! leaves a half-written index behind). The file is an [`IndexFile`]
//! encoded with bincode; a file that cannot be decoded, carries another
//! format version, or holds vectors of the wrong length is reported as an
//! [`IndexCorruptionError`].

use anyhow::{bail, Context, Result};
use bincode::{config, Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::error::IndexCorruptionError;

/// Distance function used by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 − cos(a, b)`
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::L2 => "l2",
        }
    }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => 1.0 - cosine_similarity(a, b),
            Metric::L2 => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// Map a distance back to a similarity where larger is closer.
    pub fn similarity(&self, distance: f32) -> f64 {
        match self {
            Metric::Cosine => 1.0 - distance as f64,
            Metric::L2 => 1.0 / (1.0 + distance as f64),
        }
    }
}

/// On-disk form of the index.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct IndexFile {
    pub version: u32,
    pub dims: u32,
    pub metric: Metric,
    /// Sorted by chunk id.
    pub entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub ingested_at: i64,
    pub vector: Vec<f32>,
}

impl IndexFile {
    pub const CURRENT_VERSION: u32 = 1;

    fn new(dims: usize, metric: Metric, entries: &HashMap<String, Entry>) -> Self {
        let mut entries: Vec<IndexEntry> = entries
            .iter()
            .map(|(id, entry)| IndexEntry {
                chunk_id: id.clone(),
                ingested_at: entry.ingested_at,
                vector: entry.vector.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        Self {
            version: Self::CURRENT_VERSION,
            dims: dims as u32,
            metric,
            entries,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, config::standard()).context("Failed to encode vector index")
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (file, read): (Self, usize) =
            bincode::decode_from_slice(bytes, config::standard()).map_err(|e| e.to_string())?;
        if read != bytes.len() {
            return Err(format!("{} trailing bytes after index", bytes.len() - read));
        }
        if file.version != Self::CURRENT_VERSION {
            return Err(format!(
                "unsupported format version {} (expected {})",
                file.version,
                Self::CURRENT_VERSION
            ));
        }
        if let Some(bad) = file
            .entries
            .iter()
            .find(|e| e.vector.len() != file.dims as usize)
        {
            return Err(format!(
                "vector for {} has {} dimensions, header says {}",
                bad.chunk_id,
                bad.vector.len(),
                file.dims
            ));
        }
        Ok(file)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    vector: Vec<f32>,
    ingested_at: i64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    generation: u64,
    /// Generation last written to disk.
    persisted: u64,
}

pub struct VectorStore {
    path: PathBuf,
    dims: usize,
    metric: Metric,
    inner: RwLock<Inner>,
    /// Serializes writers of the temp file.
    flush_lock: tokio::sync::Mutex<()>,
}

impl VectorStore {
    /// Load the index at `path`, or start an empty one if the file is absent.
    pub fn open(path: impl Into<PathBuf>, dims: usize, metric: Metric) -> Result<Self> {
        let path = path.into();
        if dims == 0 {
            bail!("vector dimensionality must be > 0");
        }

        let entries = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| IndexCorruptionError {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let file = IndexFile::decode(&bytes).map_err(|reason| IndexCorruptionError {
                path: path.clone(),
                reason,
            })?;
            let (file_dims, file_metric) = (file.dims as usize, file.metric);
            if file_dims != dims || file_metric != metric {
                bail!(
                    "vector index {} was built with dims={} metric={}, but the configuration \
                     asks for dims={} metric={}; run a full ingest after removing the index",
                    path.display(),
                    file_dims,
                    file_metric.as_str(),
                    dims,
                    metric.as_str()
                );
            }
            file.entries
                .into_iter()
                .map(|e| {
                    (
                        e.chunk_id,
                        Entry {
                            vector: e.vector,
                            ingested_at: e.ingested_at,
                        },
                    )
                })
                .collect()
        } else {
            HashMap::new()
        };

        tracing::debug!(path = %path.display(), vectors = entries.len(), "opened vector index");

        Ok(Self {
            path,
            dims,
            metric,
            inner: RwLock::new(Inner {
                entries,
                generation: 0,
                persisted: 0,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the vector for `chunk_id`.
    ///
    /// Last write wins by `ingested_at`: a write older than the stored one
    /// is ignored and returns `false`.
    pub fn upsert(&self, chunk_id: &str, embedding: Vec<f32>, ingested_at: i64) -> Result<bool> {
        if embedding.len() != self.dims {
            bail!(
                "embedding for {} has {} dimensions, index expects {}",
                chunk_id,
                embedding.len(),
                self.dims
            );
        }

        let mut inner = self.write();
        if let Some(existing) = inner.entries.get(chunk_id) {
            if existing.ingested_at > ingested_at {
                return Ok(false);
            }
        }
        inner.entries.insert(
            chunk_id.to_string(),
            Entry {
                vector: embedding,
                ingested_at,
            },
        );
        inner.generation += 1;
        Ok(true)
    }

    pub fn delete(&self, chunk_id: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.entries.remove(chunk_id).is_some();
        if removed {
            inner.generation += 1;
        }
        removed
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().entries.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored chunk ids, sorted.
    pub fn chunk_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, chunk_id: &str) -> Option<Vec<f32>> {
        self.read().entries.get(chunk_id).map(|e| e.vector.clone())
    }

    /// Incremented on every mutation. Used to key query caches.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// The `top_k` nearest vectors as `(chunk_id, distance)`, ascending by
    /// distance with ties broken by chunk id.
    pub fn query(&self, embedding: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        if embedding.len() != self.dims {
            bail!(
                "query embedding has {} dimensions, index expects {}",
                embedding.len(),
                self.dims
            );
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let inner = self.read();
        let mut scored: Vec<(&String, f32)> = inner
            .entries
            .iter()
            .map(|(id, entry)| (id, self.metric.distance(embedding, &entry.vector)))
            .collect();

        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(id, distance)| (id.clone(), distance))
            .collect())
    }

    /// Persist the index atomically. A no-op when nothing changed.
    ///
    /// Concurrent callers take turns; each snapshots the entries after the
    /// previous one has renamed its file, so the last write is the newest.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let (file, generation) = {
            let inner = self.read();
            if inner.generation == inner.persisted && self.path.exists() {
                return Ok(());
            }
            (IndexFile::new(self.dims, self.metric, &inner.entries), inner.generation)
        };
        let bytes = file.encode()?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("idx.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("Failed to replace {}", self.path.display()));
        }

        let mut inner = self.write();
        inner.persisted = inner.persisted.max(generation);
        drop(inner);
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "flushed vector index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir, metric: Metric) -> VectorStore {
        VectorStore::open(tmp.path().join("vectors.idx"), 3, metric).unwrap()
    }

    #[test]
    fn test_query_orders_by_distance_then_id() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::Cosine);
        vs.upsert("b", vec![1.0, 0.0, 0.0], 1).unwrap();
        vs.upsert("a", vec![1.0, 0.0, 0.0], 1).unwrap();
        vs.upsert("c", vec![0.0, 1.0, 0.0], 1).unwrap();

        let hits = vs.query(&[1.0, 0.0, 0.0], 10).unwrap();
        let ids: Vec<_> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(hits[0].1.abs() < 1e-6);
        assert!((hits[2].1 - 1.0).abs() < 1e-6);

        assert_eq!(vs.query(&[1.0, 0.0, 0.0], 1).unwrap().len(), 1);
        assert!(vs.query(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_l2_metric() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::L2);
        vs.upsert("near", vec![1.0, 1.0, 0.0], 1).unwrap();
        vs.upsert("far", vec![5.0, 5.0, 0.0], 1).unwrap();
        let hits = vs.query(&[1.0, 1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, "near");
        assert!((hits[1].1 - 32f32.sqrt()).abs() < 1e-5);
        assert!((Metric::L2.similarity(0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::Cosine);
        assert!(vs.upsert("x", vec![1.0, 0.0, 0.0], 10).unwrap());
        assert!(!vs.upsert("x", vec![0.0, 1.0, 0.0], 5).unwrap());
        assert_eq!(vs.get("x").unwrap(), vec![1.0, 0.0, 0.0]);
        assert!(vs.upsert("x", vec![0.0, 0.0, 1.0], 11).unwrap());
        assert_eq!(vs.get("x").unwrap(), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::Cosine);
        assert!(vs.upsert("x", vec![1.0, 0.0], 1).is_err());
        assert!(vs.query(&[1.0], 1).is_err());
        assert!(vs.is_empty());
    }

    #[test]
    fn test_generation_tracks_mutations() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::Cosine);
        let g0 = vs.generation();
        vs.upsert("x", vec![1.0, 0.0, 0.0], 1).unwrap();
        let g1 = vs.generation();
        assert!(g1 > g0);
        assert!(!vs.delete("missing"));
        assert_eq!(vs.generation(), g1);
        assert!(vs.delete("x"));
        assert!(vs.generation() > g1);
        assert!(!vs.contains("x"));
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let vs = store(&tmp, Metric::Cosine);
            vs.upsert("one", vec![0.25, 0.5, 1.0], 42).unwrap();
            vs.upsert("two", vec![-1.0, 0.0, 3.5], 43).unwrap();
            vs.flush().await.unwrap();
        }
        let vs = store(&tmp, Metric::Cosine);
        assert_eq!(vs.chunk_ids(), vec!["one", "two"]);
        assert_eq!(vs.get("two").unwrap(), vec![-1.0, 0.0, 3.5]);
        assert!(!tmp.path().join("vectors.idx.tmp").exists());
    }

    #[tokio::test]
    async fn test_reopen_with_other_dims_fails() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::Cosine);
        vs.upsert("one", vec![1.0, 0.0, 0.0], 1).unwrap();
        vs.flush().await.unwrap();

        assert!(VectorStore::open(tmp.path().join("vectors.idx"), 4, Metric::Cosine).is_err());
        assert!(VectorStore::open(tmp.path().join("vectors.idx"), 3, Metric::L2).is_err());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_index_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vectors.idx");
        {
            let vs = store(&tmp, Metric::Cosine);
            vs.upsert("one", vec![1.0, 0.0, 0.0], 1).unwrap();
            vs.flush().await.unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let err = match VectorStore::open(&path, 3, Metric::Cosine) {
            Err(err) => err,
            Ok(_) => panic!("truncated index must not load"),
        };
        assert!(err.downcast_ref::<IndexCorruptionError>().is_some());
    }

    #[tokio::test]
    async fn test_other_format_version_is_index_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vectors.idx");
        let file = IndexFile {
            version: IndexFile::CURRENT_VERSION + 1,
            dims: 3,
            metric: Metric::Cosine,
            entries: vec![IndexEntry {
                chunk_id: "one".to_string(),
                ingested_at: 1,
                vector: vec![1.0, 0.0, 0.0],
            }],
        };
        std::fs::write(&path, file.encode().unwrap()).unwrap();

        let err = match VectorStore::open(&path, 3, Metric::Cosine) {
            Err(err) => err,
            Ok(_) => panic!("future format must not load"),
        };
        let corruption = err.downcast_ref::<IndexCorruptionError>().unwrap();
        assert!(corruption.reason.contains("version"));
    }

    #[tokio::test]
    async fn test_short_vector_in_file_is_index_corruption() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vectors.idx");
        let file = IndexFile {
            version: IndexFile::CURRENT_VERSION,
            dims: 3,
            metric: Metric::Cosine,
            entries: vec![IndexEntry {
                chunk_id: "one".to_string(),
                ingested_at: 1,
                vector: vec![1.0, 0.0],
            }],
        };
        std::fs::write(&path, file.encode().unwrap()).unwrap();

        let err = match VectorStore::open(&path, 3, Metric::Cosine) {
            Err(err) => err,
            Ok(_) => panic!("short vector must not load"),
        };
        assert!(err.downcast_ref::<IndexCorruptionError>().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_flushes_keep_newest_snapshot() {
        let tmp = TempDir::new().unwrap();
        let vs = store(&tmp, Metric::Cosine);
        for i in 0..50 {
            vs.upsert(&format!("c{:02}", i), vec![1.0, i as f32, 0.0], 1).unwrap();
        }
        let (a, b) = tokio::join!(vs.flush(), async {
            vs.upsert("late", vec![0.0, 0.0, 1.0], 2).unwrap();
            vs.flush().await
        });
        a.unwrap();
        b.unwrap();
        vs.flush().await.unwrap();

        assert!(!tmp.path().join("vectors.idx.tmp").exists());
        let reopened = store(&tmp, Metric::Cosine);
        assert_eq!(reopened.len(), 51);
        assert!(reopened.contains("late"));
    }
}
