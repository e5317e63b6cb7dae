use super::{paragraphs, Extractor};
use crate::models::{Fragment, FragmentKind, RepositoryArtifact};

/// Generic fallback: blank-line separated paragraphs.
pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extract(&self, artifact: &RepositoryArtifact) -> Vec<Fragment> {
        let lines: Vec<&str> = artifact.content.lines().collect();
        paragraphs(&lines, FragmentKind::Text)
    }
}
