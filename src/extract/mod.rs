//! Extractors turn one [`RepositoryArtifact`] into typed [`Fragment`]s.
//!
//! Four extractors exist, selected per artifact kind by the
//! [analyzer](crate::analyzer):
//!
//! | Extractor | Produces |
//! |-----------|----------|
//! | [`DocExtractor`] | `Section` fragments, one per heading or paragraph |
//! | [`ApiSignatureExtractor`] | `Symbol` fragments, one per definition |
//! | [`EnvVarExtractor`] | `EnvVar` annotations |
//! | [`TextExtractor`] | `Text` fragments, one per paragraph |
//!
//! Body fragments from a single extractor always partition the artifact's
//! lines: in order, no gaps, no overlap.

mod api;
mod doc;
mod env;
mod text;

pub use api::ApiSignatureExtractor;
pub use doc::DocExtractor;
pub use env::EnvVarExtractor;
pub use text::TextExtractor;

use crate::models::{Fragment, FragmentKind, RepositoryArtifact};

/// Parses an artifact into fragments. Never mutates the artifact.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, artifact: &RepositoryArtifact) -> Vec<Fragment>;
}

/// Tag for each concrete extractor, used in the analyzer's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractorKind {
    Doc,
    ApiSignature,
    EnvVar,
    Text,
}

impl ExtractorKind {
    pub fn extractor(&self) -> &'static dyn Extractor {
        match self {
            ExtractorKind::Doc => &DocExtractor,
            ExtractorKind::ApiSignature => &ApiSignatureExtractor,
            ExtractorKind::EnvVar => &EnvVarExtractor,
            ExtractorKind::Text => &TextExtractor,
        }
    }

    pub fn name(&self) -> &'static str {
        self.extractor().name()
    }

    pub fn extract(&self, artifact: &RepositoryArtifact) -> Vec<Fragment> {
        self.extractor().extract(artifact)
    }
}

/// Build a fragment from the 0-based inclusive line range `start..=end`.
pub(crate) fn fragment(
    kind: FragmentKind,
    lines: &[&str],
    start: usize,
    end: usize,
    symbol: Option<String>,
) -> Fragment {
    Fragment {
        kind,
        text: lines[start..=end].join("\n"),
        start_line: start + 1,
        end_line: end + 1,
        symbol,
        nested: false,
    }
}

/// Cut `lines` at each boundary. `starts` must be sorted and begin at 0.
/// Each boundary runs up to the line before the next one.
pub(crate) fn partition(
    kind_of: impl Fn(usize) -> FragmentKind,
    lines: &[&str],
    starts: &[(usize, Option<String>)],
) -> Vec<Fragment> {
    let mut out = Vec::with_capacity(starts.len());
    for (i, (start, symbol)) in starts.iter().enumerate() {
        let end = match starts.get(i + 1) {
            Some((next, _)) => next - 1,
            None => lines.len() - 1,
        };
        out.push(fragment(kind_of(i), lines, *start, end, symbol.clone()));
    }
    out
}

/// Blank-line separated paragraphs covering every line.
///
/// Leading blank lines belong to the first paragraph; blank lines between
/// paragraphs trail the one before. Whitespace-only input yields nothing.
pub(crate) fn paragraphs(lines: &[&str], kind: FragmentKind) -> Vec<Fragment> {
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Vec::new();
    }

    let mut starts = vec![(0, None)];
    let mut seen_text = false;
    for i in 0..lines.len() {
        let blank = lines[i].trim().is_empty();
        if !blank && seen_text && i > 0 && lines[i - 1].trim().is_empty() {
            starts.push((i, None));
        }
        seen_text |= !blank;
    }
    partition(|_| kind, lines, &starts)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::crawler::classify;
    use crate::models::{Fragment, RepositoryArtifact};

    pub fn artifact(path: &str, content: &str) -> RepositoryArtifact {
        let (kind, language) = classify(path);
        RepositoryArtifact {
            path: path.to_string(),
            content: content.to_string(),
            kind,
            language: language.to_string(),
            size_bytes: content.len() as u64,
            checksum: "0".repeat(64),
        }
    }

    /// Assert that body fragments cover lines 1..=total in order.
    pub fn assert_partition(fragments: &[Fragment], total: usize) {
        let mut next = 1;
        for f in fragments {
            assert_eq!(f.start_line, next, "gap or overlap before {:?}", f.symbol);
            assert!(f.end_line >= f.start_line);
            next = f.end_line + 1;
        }
        assert_eq!(next, total + 1, "fragments do not reach the last line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraphs_cover_all_lines() {
        let lines = vec!["", "first", "para", "", "", "second", ""];
        let frags = paragraphs(&lines, FragmentKind::Text);
        assert_eq!(frags.len(), 2);
        assert_eq!((frags[0].start_line, frags[0].end_line), (1, 5));
        assert_eq!((frags[1].start_line, frags[1].end_line), (6, 7));
        test_support::assert_partition(&frags, lines.len());
    }

    #[test]
    fn test_paragraphs_whitespace_only() {
        assert!(paragraphs(&["  ", "\t"], FragmentKind::Text).is_empty());
        assert!(paragraphs(&[], FragmentKind::Text).is_empty());
    }

    #[test]
    fn test_dispatch_names() {
        assert_eq!(ExtractorKind::ApiSignature.name(), "api_signature");
        assert_eq!(ExtractorKind::Doc.name(), "doc");
        assert_eq!(ExtractorKind::EnvVar.name(), "env_var");
        assert_eq!(ExtractorKind::Text.name(), "text");
    }
}
