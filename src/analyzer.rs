//! Content analyzer: runs the extractors registered for an artifact's kind
//! and merges their output into one [`AnalyzedArtifact`].
//!
//! The dispatch table is fixed:
//!
//! | Kind | Extractors, in priority order |
//! |------|-------------------------------|
//! | `code` | api_signature, env_var, text |
//! | `doc` | doc, text |
//! | `config` | env_var, text |
//! | `unknown` | text |
//!
//! Body fragments come from the first extractor that yields any; generic
//! text is the last resort. Annotations are collected from every extractor.

use crate::extract::ExtractorKind;
use crate::models::{AnalyzedArtifact, ArtifactKind, Fragment, RepositoryArtifact};

pub fn extractors_for(kind: ArtifactKind) -> &'static [ExtractorKind] {
    match kind {
        ArtifactKind::Code => &[
            ExtractorKind::ApiSignature,
            ExtractorKind::EnvVar,
            ExtractorKind::Text,
        ],
        ArtifactKind::Doc => &[ExtractorKind::Doc, ExtractorKind::Text],
        ArtifactKind::Config => &[ExtractorKind::EnvVar, ExtractorKind::Text],
        ArtifactKind::Unknown => &[ExtractorKind::Text],
    }
}

pub fn analyze(artifact: &RepositoryArtifact) -> AnalyzedArtifact {
    let mut body: Option<Vec<Fragment>> = None;
    let mut annotations = Vec::new();

    for extractor in extractors_for(artifact.kind) {
        let (found_body, found_annotations): (Vec<Fragment>, Vec<Fragment>) = extractor
            .extract(artifact)
            .into_iter()
            .partition(|f| f.kind.is_body());
        annotations.extend(found_annotations);
        if body.is_none() && !found_body.is_empty() {
            tracing::trace!(
                path = %artifact.path,
                extractor = extractor.name(),
                fragments = found_body.len(),
                "body fragments"
            );
            body = Some(found_body);
        }
    }

    annotations.sort_by(|a, b| a.start_line.cmp(&b.start_line));

    AnalyzedArtifact {
        path: artifact.path.clone(),
        kind: artifact.kind,
        language: artifact.language.clone(),
        checksum: artifact.checksum.clone(),
        body: body.unwrap_or_default(),
        annotations,
    }
}
