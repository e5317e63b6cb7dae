//! Index statistics and health overview.
//!
//! Summarizes what's indexed: artifact and chunk counts per kind, embedding
//! coverage, and on-disk sizes. Used by `repoctx stats` to give confidence
//! that ingestion is keeping both stores in step.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use crate::engine::Engine;
use crate::metadata_store::MetadataStats;

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub metadata: MetadataStats,
    pub vectors: usize,
    /// Metadata records that have a vector.
    pub embedded: usize,
    /// Vectors with no metadata record.
    pub orphaned: usize,
    pub metadata_bytes: u64,
    pub index_bytes: u64,
    pub model: String,
    pub metric: String,
    pub dims: usize,
}

impl IndexStats {
    /// Percentage of chunks that can be found by vector search.
    pub fn coverage_percent(&self) -> i64 {
        if self.metadata.chunks > 0 {
            (self.embedded as i64 * 100) / self.metadata.chunks
        } else {
            0
        }
    }
}

pub async fn collect(engine: &Engine) -> Result<IndexStats> {
    let metadata = engine.metadata().stats().await?;
    let ids: HashSet<String> = engine
        .metadata()
        .all_chunk_ids()
        .await?
        .into_iter()
        .collect();
    let vector_ids = engine.vectors().chunk_ids();
    let embedded = vector_ids.iter().filter(|id| ids.contains(*id)).count();

    let storage = &engine.config().storage;
    let metadata_path = storage.metadata_path();
    let metadata_bytes = file_size(&metadata_path) + file_size(&metadata_path.with_extension("sqlite-wal"));

    Ok(IndexStats {
        metadata,
        vectors: vector_ids.len(),
        embedded,
        orphaned: vector_ids.len() - embedded,
        metadata_bytes,
        index_bytes: file_size(&storage.vector_index_path()),
        model: engine.embedder().model_name().to_string(),
        metric: engine.vectors().metric().as_str().to_string(),
        dims: engine.vectors().dims(),
    })
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Run the stats command: collect and print a summary.
pub async fn run_stats(engine: &Engine) -> Result<()> {
    let stats = collect(engine).await?;
    let storage = &engine.config().storage;

    println!("repo-context: Index Stats");
    println!("==========================");
    println!();
    println!("  Storage:     {}", storage.root.display());
    println!("  Metadata:    {}", format_bytes(stats.metadata_bytes));
    println!("  Vectors:     {}", format_bytes(stats.index_bytes));
    println!(
        "  Model:       {} ({} dims, {})",
        stats.model, stats.dims, stats.metric
    );
    println!();
    println!("  Artifacts:   {}", stats.metadata.artifacts);
    println!("  Chunks:      {}", stats.metadata.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded,
        stats.metadata.chunks,
        stats.coverage_percent()
    );
    if stats.orphaned > 0 {
        println!("  Orphaned:    {} (run `repoctx ingest --full`)", stats.orphaned);
    }
    let last = match stats.metadata.last_ingested_at {
        Some(ts) => format_ts_relative(ts),
        None => "never".to_string(),
    };
    println!("  Last ingest: {}", last);

    if !stats.metadata.by_kind.is_empty() {
        println!();
        println!("  By kind:");
        println!("  {:<12} {:>10} {:>8}", "KIND", "ARTIFACTS", "CHUNKS");
        println!("  {}", "-".repeat(32));
        for k in &stats.metadata.by_kind {
            println!("  {:<12} {:>10} {:>8}", k.kind, k.artifacts, k.chunks);
        }
    }
    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    format_ts_relative_to(ts, chrono::Utc::now().timestamp())
}

fn format_ts_relative_to(ts: i64, now: i64) -> String {
    let delta = now - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
