//! Core data models used throughout the ingestion and retrieval pipeline.
//!
//! Artifacts flow from the crawler into the analyzer as
//! [`RepositoryArtifact`]s, come out as [`AnalyzedArtifact`]s, are cut into
//! [`Chunk`]s, and are persisted as [`MetadataRecord`]s (plus one embedding
//! per chunk id in the vector store). Queries produce a [`RetrievalResult`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Coarse classification of a repository file, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Code,
    Doc,
    Config,
    Unknown,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Code => "code",
            ArtifactKind::Doc => "doc",
            ArtifactKind::Config => "config",
            ArtifactKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(ArtifactKind::Code),
            "doc" => Ok(ArtifactKind::Doc),
            "config" => Ok(ArtifactKind::Config),
            "unknown" => Ok(ArtifactKind::Unknown),
            other => anyhow::bail!(
                "Unknown artifact kind: '{}'. Use code, doc, config, or unknown.",
                other
            ),
        }
    }
}

/// A readable text file produced by the crawler.
#[derive(Debug, Clone)]
pub struct RepositoryArtifact {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub content: String,
    pub kind: ArtifactKind,
    /// Language tag such as `"rust"`, `"python"` or `"markdown"`.
    pub language: String,
    pub size_bytes: u64,
    /// SHA-256 of the file bytes, hex encoded.
    pub checksum: String,
}

/// What an extractor recognized a piece of an artifact as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    /// A documentation section (usually under one heading).
    Section,
    /// A code definition: function, class, type, impl block.
    Symbol,
    /// Plain text with no recognized structure.
    Text,
    /// A reference to an environment variable. Annotation only.
    EnvVar,
}

impl FragmentKind {
    /// Body fragments carry the artifact's text; annotations only describe it.
    pub fn is_body(&self) -> bool {
        !matches!(self, FragmentKind::EnvVar)
    }
}

/// A typed piece of an artifact produced by an extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub text: String,
    /// First line, 1-based.
    pub start_line: usize,
    /// Last line, inclusive.
    pub end_line: usize,
    /// Definition name, section heading, or variable name.
    pub symbol: Option<String>,
    /// Defined inside the unit started by an earlier fragment (a method in
    /// an impl block, a nested function). The chunker keeps such a unit
    /// whole when it fits and only cuts at nested fragments when it does not.
    pub nested: bool,
}

/// Output of the content analyzer: one artifact's body fragments (in line
/// order, covering every line) and its annotations.
#[derive(Debug, Clone)]
pub struct AnalyzedArtifact {
    pub path: String,
    pub kind: ArtifactKind,
    pub language: String,
    pub checksum: String,
    pub body: Vec<Fragment>,
    pub annotations: Vec<Fragment>,
}

/// A bounded, independently embeddable unit of repository text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Deterministic UUID over path, line offset and text hash.
    pub id: String,
    pub path: String,
    pub text: String,
    /// Length of `text` in characters.
    pub char_len: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: ArtifactKind,
    pub language: String,
    pub parent_symbol: Option<String>,
    pub symbols: Vec<String>,
    pub env_vars: Vec<String>,
    /// SHA-256 of `text`, hex encoded.
    pub checksum: String,
    pub artifact_checksum: String,
}

/// The relational row stored for every live chunk id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataRecord {
    pub chunk_id: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub kind: ArtifactKind,
    pub language: String,
    pub parent_symbol: Option<String>,
    pub symbols: Vec<String>,
    pub env_vars: Vec<String>,
    pub checksum: String,
    pub artifact_checksum: String,
    pub char_len: i64,
    pub text: String,
    /// Unix seconds.
    pub ingested_at: i64,
}

impl MetadataRecord {
    pub fn from_chunk(chunk: &Chunk, ingested_at: i64) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            path: chunk.path.clone(),
            start_line: chunk.start_line as i64,
            end_line: chunk.end_line as i64,
            kind: chunk.kind,
            language: chunk.language.clone(),
            parent_symbol: chunk.parent_symbol.clone(),
            symbols: chunk.symbols.clone(),
            env_vars: chunk.env_vars.clone(),
            checksum: chunk.checksum.clone(),
            artifact_checksum: chunk.artifact_checksum.clone(),
            char_len: chunk.char_len as i64,
            text: chunk.text.clone(),
            ingested_at,
        }
    }
}

/// One row per ingested repository path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub kind: ArtifactKind,
    pub language: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub chunk_count: i64,
    pub ingested_at: i64,
}

/// A retrieved chunk with its relevance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub record: MetadataRecord,
    /// Final ranking score (similarity plus any symbol boost).
    pub score: f64,
    /// Raw vector similarity.
    pub similarity: f64,
}

/// Ranked context for one query, at most `top_k` long.
///
/// An empty result means "no context found" and is not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn top(&self) -> Option<&ScoredChunk> {
        self.hits.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredChunk> {
        self.hits.iter()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.record.chunk_id.as_str()).collect()
    }
}
