//! Repository crawler.
//!
//! Walks a local checkout lazily with `walkdir`, pruning ignored
//! directories, and yields one [`RepositoryArtifact`] per readable text
//! file. Binary and oversized files are skipped silently (debug log);
//! anything that cannot be read becomes an [`IngestionError`] in the
//! stream and the walk continues.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::{DirEntry, WalkDir};

use crate::config::RepositoryConfig;
use crate::error::IngestionError;
use crate::models::{ArtifactKind, RepositoryArtifact};

/// Bytes inspected for a NUL byte when sniffing binary content.
const BINARY_SNIFF_BYTES: usize = 8192;

const DEFAULT_IGNORES: &[&str] = &[
    "**/.git",
    "**/.hg",
    "**/.svn",
    "**/target",
    "**/node_modules",
    "**/build",
    "**/dist",
    "**/__pycache__",
    "**/.venv",
    "**/venv",
    "**/*.lock",
];

pub struct Crawler {
    root: PathBuf,
    ignore: Arc<GlobSet>,
    include: Option<Arc<GlobSet>>,
    max_file_bytes: u64,
    follow_symlinks: bool,
}

/// Everything a finished crawl produced.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub artifacts: Vec<RepositoryArtifact>,
    pub failures: Vec<IngestionError>,
}

impl Crawler {
    pub fn new(root: impl Into<PathBuf>, config: &RepositoryConfig) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("Repository root does not exist: {}", root.display());
        }

        let mut ignores: Vec<String> = DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect();
        ignores.extend(config.ignore_globs.iter().cloned());
        let ignore = Arc::new(build_globset(&ignores)?);

        let include = if config.include_globs.is_empty() {
            None
        } else {
            Some(Arc::new(build_globset(&config.include_globs)?))
        };

        Ok(Self {
            root,
            ignore,
            include,
            max_file_bytes: config.max_file_bytes,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a fresh walk. Each call restarts from the root.
    pub fn crawl(&self) -> Crawl {
        let root = self.root.clone();
        let ignore = Arc::clone(&self.ignore);
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !is_ignored(&root, &ignore, entry));

        Crawl {
            walker: Box::new(walker),
            root: self.root.clone(),
            ignore: Arc::clone(&self.ignore),
            include: self.include.clone(),
            max_file_bytes: self.max_file_bytes,
        }
    }

    /// Drain a full crawl, separating artifacts from failures.
    pub fn crawl_all(&self) -> CrawlOutcome {
        let mut outcome = CrawlOutcome::default();
        for item in self.crawl() {
            match item {
                Ok(artifact) => outcome.artifacts.push(artifact),
                Err(err) => outcome.failures.push(err),
            }
        }
        outcome
    }
}

/// A lazy, in-progress walk over the repository.
pub struct Crawl {
    walker: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>,
    root: PathBuf,
    ignore: Arc<GlobSet>,
    include: Option<Arc<GlobSet>>,
    max_file_bytes: u64,
}

impl Iterator for Crawl {
    type Item = Result<RepositoryArtifact, IngestionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| relative_path(&self.root, p))
                        .unwrap_or_default();
                    tracing::warn!(path = %path, error = %err, "walk error");
                    return Some(Err(IngestionError::new(path, err)));
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let rel = relative_path(&self.root, entry.path());
            if self.ignore.is_match(&rel) {
                continue;
            }
            if let Some(include) = &self.include {
                if !include.is_match(&rel) {
                    continue;
                }
            }

            match self.read_artifact(entry.path(), &rel) {
                Ok(Some(artifact)) => return Some(Ok(artifact)),
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(path = %rel, error = %err, "failed to read artifact");
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Crawl {
    fn read_artifact(
        &self,
        path: &Path,
        rel: &str,
    ) -> Result<Option<RepositoryArtifact>, IngestionError> {
        let metadata = std::fs::metadata(path).map_err(|e| IngestionError::new(rel, e))?;
        if metadata.len() > self.max_file_bytes {
            tracing::debug!(path = %rel, size = metadata.len(), "skipping oversized file");
            return Ok(None);
        }

        let mut bytes = Vec::with_capacity(metadata.len() as usize);
        std::fs::File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| IngestionError::new(rel, e))?;

        if is_binary(&bytes) {
            tracing::debug!(path = %rel, "skipping binary file");
            return Ok(None);
        }

        let checksum = format!("{:x}", Sha256::digest(&bytes));
        let size_bytes = bytes.len() as u64;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!(path = %rel, "skipping non-UTF-8 file");
                return Ok(None);
            }
        };

        let (kind, language) = classify(rel);
        Ok(Some(RepositoryArtifact {
            path: rel.to_string(),
            content,
            kind,
            language: language.to_string(),
            size_bytes,
            checksum,
        }))
    }
}

fn is_ignored(root: &Path, ignore: &GlobSet, entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    ignore.is_match(relative_path(root, entry.path()))
}

fn is_binary(bytes: &[u8]) -> bool {
    let end = bytes.len().min(BINARY_SNIFF_BYTES);
    bytes[..end].contains(&0)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Derive the artifact kind and language tag from a repository path.
pub fn classify(path: &str) -> (ArtifactKind, &'static str) {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let lower = file_name.to_ascii_lowercase();

    if lower == ".env" || lower.starts_with(".env.") {
        return (ArtifactKind::Config, "dotenv");
    }
    match lower.as_str() {
        "dockerfile" => return (ArtifactKind::Config, "dockerfile"),
        "makefile" => return (ArtifactKind::Config, "make"),
        "readme" | "license" | "changelog" | "contributing" | "authors" => {
            return (ArtifactKind::Doc, "text")
        }
        _ => {}
    }

    let ext = match lower.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext,
        _ => return (ArtifactKind::Unknown, "text"),
    };

    match ext {
        "rs" => (ArtifactKind::Code, "rust"),
        "py" | "pyi" => (ArtifactKind::Code, "python"),
        "js" | "jsx" | "mjs" | "cjs" => (ArtifactKind::Code, "javascript"),
        "ts" | "tsx" => (ArtifactKind::Code, "typescript"),
        "go" => (ArtifactKind::Code, "go"),
        "java" => (ArtifactKind::Code, "java"),
        "kt" | "kts" => (ArtifactKind::Code, "kotlin"),
        "cs" => (ArtifactKind::Code, "csharp"),
        "c" | "h" => (ArtifactKind::Code, "c"),
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => (ArtifactKind::Code, "cpp"),
        "rb" => (ArtifactKind::Code, "ruby"),
        "sh" | "bash" | "zsh" => (ArtifactKind::Code, "shell"),
        "swift" => (ArtifactKind::Code, "swift"),
        "php" => (ArtifactKind::Code, "php"),
        "scala" => (ArtifactKind::Code, "scala"),
        "md" | "markdown" => (ArtifactKind::Doc, "markdown"),
        "rst" => (ArtifactKind::Doc, "restructuredtext"),
        "adoc" | "asciidoc" => (ArtifactKind::Doc, "asciidoc"),
        "txt" => (ArtifactKind::Doc, "text"),
        "toml" => (ArtifactKind::Config, "toml"),
        "yaml" | "yml" => (ArtifactKind::Config, "yaml"),
        "json" => (ArtifactKind::Config, "json"),
        "ini" | "cfg" | "conf" => (ArtifactKind::Config, "ini"),
        "properties" => (ArtifactKind::Config, "properties"),
        "xml" => (ArtifactKind::Config, "xml"),
        "env" => (ArtifactKind::Config, "dotenv"),
        _ => (ArtifactKind::Unknown, "text"),
    }
}
