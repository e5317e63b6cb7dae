use once_cell::sync::Lazy;
use regex::Regex;

use super::{paragraphs, partition, Extractor};
use crate::models::{Fragment, FragmentKind, RepositoryArtifact};

static MARKDOWN_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}#{1,6}[ \t]+(.+?)[ \t#]*$").expect("Invalid regex"));

static ASCIIDOC_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^={1,6}[ \t]+(.+?)[ \t]*$").expect("Invalid regex"));

const RST_RULE_CHARS: &str = "=-~^\"'*+#`:.";

/// Splits documentation into sections at headings.
///
/// Markdown, AsciiDoc and reStructuredText headings are recognized (fenced
/// code blocks are skipped). Without headings the document falls back to
/// paragraph sections.
pub struct DocExtractor;

impl Extractor for DocExtractor {
    fn name(&self) -> &'static str {
        "doc"
    }

    fn extract(&self, artifact: &RepositoryArtifact) -> Vec<Fragment> {
        let lines: Vec<&str> = artifact.content.lines().collect();
        if lines.iter().all(|l| l.trim().is_empty()) {
            return Vec::new();
        }

        let headings = match artifact.language.as_str() {
            "markdown" => markdown_headings(&lines),
            "asciidoc" => asciidoc_headings(&lines),
            "restructuredtext" => rst_headings(&lines),
            _ => Vec::new(),
        };

        if headings.is_empty() {
            return paragraphs(&lines, FragmentKind::Section);
        }

        let mut starts: Vec<(usize, Option<String>)> = Vec::with_capacity(headings.len() + 1);
        let preamble_is_blank = lines[..headings[0].0].iter().all(|l| l.trim().is_empty());
        for (i, (line, title)) in headings.into_iter().enumerate() {
            // A blank preamble folds into the first section.
            let start = if i == 0 && preamble_is_blank { 0 } else { line };
            if i == 0 && start > 0 {
                starts.push((0, None));
            }
            starts.push((start, Some(title)));
        }

        partition(|_| FragmentKind::Section, &lines, &starts)
    }
}

/// Opening marker of a fenced code block, if `line` is one.
fn fence_marker(line: &str) -> Option<&'static str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn markdown_headings(lines: &[&str]) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut fence: Option<&str> = None;
    for (i, line) in lines.iter().enumerate() {
        if let Some(open) = fence {
            if line.trim_start().starts_with(open) {
                fence = None;
            }
            continue;
        }
        if let Some(marker) = fence_marker(line) {
            fence = Some(marker);
            continue;
        }
        if let Some(caps) = MARKDOWN_HEADING.captures(line) {
            out.push((i, caps[1].trim().to_string()));
        }
    }
    out
}

fn asciidoc_headings(lines: &[&str]) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut in_block = false;
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == "----" || line.trim() == "...." {
            in_block = !in_block;
            continue;
        }
        if in_block {
            continue;
        }
        if let Some(caps) = ASCIIDOC_HEADING.captures(line) {
            out.push((i, caps[1].to_string()));
        }
    }
    out
}

/// reStructuredText titles: a text line underlined (and optionally
/// overlined) by a run of one punctuation character at least as long.
fn rst_headings(lines: &[&str]) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < lines.len() {
        let title = lines[i].trim_end();
        let under = lines[i + 1].trim_end();
        if !title.trim().is_empty()
            && !is_rst_rule(title)
            && is_rst_rule(under)
            && under.chars().count() >= title.trim().chars().count()
        {
            let overlined = i > 0 && is_rst_rule(lines[i - 1].trim_end());
            let start = if overlined { i - 1 } else { i };
            out.push((start, title.trim().to_string()));
            i += 2;
            continue;
        }
        i += 1;
    }
    out
}

fn is_rst_rule(line: &str) -> bool {
    let mut chars = line.chars();
    match chars.next() {
        Some(first) if RST_RULE_CHARS.contains(first) => {
            line.chars().count() >= 3 && chars.all(|c| c == first)
        }
        _ => false,
    }
}
