use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vector_store::Metric;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

impl StorageConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.sqlite")
    }

    pub fn vector_index_path(&self) -> PathBuf {
        self.root.join("vectors.idx")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    #[serde(default = "default_repository_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: default_repository_root(),
            ignore_globs: Vec::new(),
            include_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
        }
    }
}

fn default_repository_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Fraction of `max_chars` repeated between adjacent sliding windows.
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_ratio: default_overlap_ratio(),
        }
    }
}

fn default_max_tokens() -> usize {
    512
}
fn default_overlap_ratio() -> f64 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    #[serde(default)]
    pub metric: Metric,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime in seconds. `0` disables expiry.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    4096
}
fn default_cache_ttl_secs() -> u64 {
    3600
}

impl CacheConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// Added to the similarity of chunks defining a symbol named in the query.
    #[serde(default = "default_symbol_boost")]
    pub symbol_boost: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            overfetch_factor: default_overfetch_factor(),
            symbol_boost: default_symbol_boost(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_overfetch_factor() -> usize {
    4
}
fn default_symbol_boost() -> f64 {
    0.05
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Artifacts analyzed and chunked in parallel.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: None,
            url: None,
            max_tokens: default_completion_max_tokens(),
            timeout_secs: default_completion_timeout_secs(),
        }
    }
}

fn default_completion_provider() -> String {
    "disabled".to_string()
}
fn default_completion_max_tokens() -> u32 {
    1024
}
fn default_completion_timeout_secs() -> u64 {
    60
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Default configuration with all state kept under `root`.
    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig { root: root.into() },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if !(0.0..=0.5).contains(&self.chunking.overlap_ratio) {
            anyhow::bail!("chunking.overlap_ratio must be in [0.0, 0.5]");
        }

        // Validate retrieval
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be >= 1");
        }
        if self.retrieval.overfetch_factor == 0 {
            anyhow::bail!("retrieval.overfetch_factor must be >= 1");
        }
        if self.retrieval.symbol_boost < 0.0 {
            anyhow::bail!("retrieval.symbol_boost must be >= 0.0");
        }

        // Validate embedding
        if self.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hash" => {}
            "openai" | "ollama" => {
                if self.embedding.model.is_none() {
                    anyhow::bail!(
                        "embedding.model must be specified when provider is '{}'",
                        self.embedding.provider
                    );
                }
            }
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
                other
            ),
        }

        if self.cache.capacity == 0 {
            anyhow::bail!("cache.capacity must be > 0");
        }
        if self.ingest.workers == 0 {
            anyhow::bail!("ingest.workers must be > 0");
        }

        match self.completion.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown completion provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
