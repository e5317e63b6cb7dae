//! Typed error kinds surfaced by the ingestion and retrieval pipeline.
//!
//! Most functions in this crate return [`anyhow::Result`]. The types here
//! are the leaf errors a caller may want to tell apart; recover them with
//! `err.downcast_ref::<EmbeddingServiceError>()` and friends.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// An artifact could not be read or analyzed.
///
/// Ingestion skips the artifact, keeps going, and reports every
/// `IngestionError` in [`IngestReport::failures`](crate::ingest::IngestReport).
#[derive(Debug, Clone, Error)]
#[error("failed to ingest {}: {reason}", path.display())]
pub struct IngestionError {
    pub path: PathBuf,
    pub reason: String,
}

impl IngestionError {
    pub fn new(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// The external embedding service failed or returned a malformed response.
///
/// Never retried internally; the caller owns retry policy.
#[derive(Debug, Clone, Error)]
pub enum EmbeddingServiceError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

/// The persisted vector index could not be loaded. A full reindex is required.
#[derive(Debug, Clone, Error)]
#[error("vector index at {} is corrupt: {reason} (run a full ingest to rebuild it)", path.display())]
pub struct IndexCorruptionError {
    pub path: PathBuf,
    pub reason: String,
}

/// A vector hit whose metadata record no longer exists.
///
/// Never returned to callers: the retriever logs it and drops the hit.
#[derive(Debug, Clone, Error)]
#[error("dangling vector reference: chunk {chunk_id} has no metadata record")]
pub struct DanglingReference {
    pub chunk_id: String,
}

/// The computation behind a cache key failed.
///
/// Every caller waiting on the same key receives a clone of this error and
/// nothing is stored in the cache.
#[derive(Debug, Clone, Error)]
#[error("cache computation failed: {0}")]
pub struct CacheComputeError(pub Arc<anyhow::Error>);

impl CacheComputeError {
    /// The error produced by the compute function.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

/// The external completion service failed.
#[derive(Debug, Clone, Error)]
pub enum CompletionServiceError {
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("completion service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid completion response: {0}")]
    InvalidResponse(String),
    #[error("completion provider is disabled")]
    Disabled,
}

/// Re-raise the error a cached computation failed with.
///
/// Embedding failures keep their type so callers can still
/// `downcast_ref::<EmbeddingServiceError>()`; anything else stays wrapped.
pub fn unwrap_cache_error(err: CacheComputeError) -> anyhow::Error {
    if let Some(emb) = err.inner().downcast_ref::<EmbeddingServiceError>() {
        return emb.clone().into();
    }
    err.into()
}
