//! Structure-aware chunker.
//!
//! Turns an [`AnalyzedArtifact`] into [`Chunk`]s of at most `max_chars`
//! characters (`max_tokens × 4`).
//!
//! # Algorithm
//!
//! 1. A definition and the fragments nested in it (methods of an impl
//!    block, inner functions) form one unit. A unit that fits is kept whole;
//!    a larger one is cut only at its nested fragments.
//! 2. Adjacent units are packed into one chunk while the joined text still
//!    fits. A unit or fragment that fits is never split.
//! 3. A fragment larger than `max_chars` is cut with a line-aligned
//!    sliding window. Consecutive windows share at most
//!    `overlap_ratio × max_chars` characters of whole lines and always
//!    advance by at least one line.
//! 4. A single line longer than `max_chars` is hard-split on char
//!    boundaries, with the same overlap.
//! 5. Chunks that contain only whitespace are dropped, so a blank artifact
//!    yields no chunks.
//!
//! Each chunk id is a UUID v5 over the path, the start line and the
//! SHA-256 of the chunk text: identical input always yields identical ids,
//! and an id changes whenever its text does.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{AnalyzedArtifact, Chunk, Fragment};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Namespace for chunk ids.
const CHUNK_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1f, 0x0c, 0x52, 0x3a, 0x94, 0x4e, 0x27, 0x9d, 0x11, 0x58, 0xe2, 0x7c, 0x40, 0xa3, 0x0f,
]);

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
    overlap_chars: usize,
}

/// A contiguous run of text that becomes part of (or all of) one chunk.
#[derive(Debug)]
struct Piece {
    text: String,
    char_len: usize,
    start_line: usize,
    end_line: usize,
    /// Symbols whose definitions start in this piece, in line order.
    symbols: Vec<String>,
    /// Symbol this piece continues, for windows after the first.
    parent: Option<String>,
    /// Windows of an oversized fragment stand alone.
    packable: bool,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let max_chars = (config.max_tokens * CHARS_PER_TOKEN).max(1);
        let overlap_chars = (config.overlap_ratio * max_chars as f64).floor() as usize;
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_chars / 2),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    pub fn chunk(&self, analyzed: &AnalyzedArtifact) -> Vec<Chunk> {
        let mut pieces = Vec::new();
        for unit in units(&analyzed.body) {
            match self.whole_unit(unit) {
                Some(piece) => pieces.push(piece),
                None => {
                    for fragment in unit {
                        self.pieces_of(fragment, &mut pieces);
                    }
                }
            }
        }

        let mut chunks = Vec::new();
        let mut group: Vec<Piece> = Vec::new();
        let mut group_len = 0;

        for piece in pieces {
            if !piece.packable {
                self.flush(analyzed, &mut group, &mut chunks);
                group_len = 0;
                self.flush(analyzed, &mut vec![piece], &mut chunks);
                continue;
            }
            let joined = if group.is_empty() {
                piece.char_len
            } else {
                group_len + 1 + piece.char_len
            };
            if joined > self.max_chars {
                self.flush(analyzed, &mut group, &mut chunks);
                group_len = piece.char_len;
            } else {
                group_len = joined;
            }
            group.push(piece);
        }
        self.flush(analyzed, &mut group, &mut chunks);

        // Identical text on the same line (repeated hard-split windows) is
        // kept once.
        let mut seen = HashSet::new();
        chunks.retain(|c| seen.insert(c.id.clone()));
        chunks
    }

    /// One packable piece for a multi-fragment unit that fits in a chunk.
    fn whole_unit(&self, unit: &[Fragment]) -> Option<Piece> {
        let (first, last) = match unit {
            [first, .., last] => (first, last),
            _ => return None,
        };
        let text = unit
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let char_len = text.chars().count();
        if char_len > self.max_chars {
            return None;
        }

        let mut symbols: Vec<String> = Vec::new();
        for symbol in unit.iter().filter_map(|f| f.symbol.as_ref()) {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
        Some(Piece {
            text,
            char_len,
            start_line: first.start_line,
            end_line: last.end_line,
            symbols,
            parent: None,
            packable: true,
        })
    }

    fn pieces_of(&self, fragment: &Fragment, out: &mut Vec<Piece>) {
        let char_len = fragment.text.chars().count();
        if char_len <= self.max_chars {
            out.push(Piece {
                text: fragment.text.clone(),
                char_len,
                start_line: fragment.start_line,
                end_line: fragment.end_line,
                symbols: fragment.symbol.iter().cloned().collect(),
                parent: None,
                packable: true,
            });
            return;
        }

        let first = out.len();
        let lines: Vec<(usize, &str, usize)> = fragment
            .text
            .split('\n')
            .enumerate()
            .map(|(i, l)| (fragment.start_line + i, l, l.chars().count()))
            .collect();

        // Runs of ordinary lines are windowed; overlong lines are hard-split.
        let mut run_start = 0;
        for (i, &(line_no, line, len)) in lines.iter().enumerate() {
            if len > self.max_chars {
                self.window_lines(&lines[run_start..i], out);
                self.hard_split(line_no, line, out);
                run_start = i + 1;
            }
        }
        self.window_lines(&lines[run_start..], out);

        for (n, piece) in out[first..].iter_mut().enumerate() {
            if n == 0 {
                piece.symbols = fragment.symbol.iter().cloned().collect();
            } else {
                piece.parent = fragment.symbol.clone();
            }
        }
    }

    fn window_lines(&self, lines: &[(usize, &str, usize)], out: &mut Vec<Piece>) {
        let n = lines.len();
        let mut i = 0;
        while i < n {
            let mut total = lines[i].2;
            let mut j = i + 1;
            while j < n && total + 1 + lines[j].2 <= self.max_chars {
                total += 1 + lines[j].2;
                j += 1;
            }

            let text = lines[i..j]
                .iter()
                .map(|(_, l, _)| *l)
                .collect::<Vec<_>>()
                .join("\n");
            out.push(Piece {
                text,
                char_len: total,
                start_line: lines[i].0,
                end_line: lines[j - 1].0,
                symbols: Vec::new(),
                parent: None,
                packable: false,
            });

            if j == n {
                break;
            }

            // Step back over whole lines that fit in the overlap budget.
            let mut k = j;
            let mut overlap = 0;
            while k - 1 > i {
                let add = lines[k - 1].2 + usize::from(k < j);
                if overlap + add > self.overlap_chars {
                    break;
                }
                overlap += add;
                k -= 1;
            }
            i = k;
        }
    }

    fn hard_split(&self, line_no: usize, line: &str, out: &mut Vec<Piece>) {
        let bounds: Vec<usize> = line
            .char_indices()
            .map(|(b, _)| b)
            .chain(std::iter::once(line.len()))
            .collect();
        let total = bounds.len() - 1;
        let step = (self.max_chars - self.overlap_chars).max(1);

        let mut start = 0;
        loop {
            let end = (start + self.max_chars).min(total);
            out.push(Piece {
                text: line[bounds[start]..bounds[end]].to_string(),
                char_len: end - start,
                start_line: line_no,
                end_line: line_no,
                symbols: Vec::new(),
                parent: None,
                packable: false,
            });
            if end == total {
                break;
            }
            start += step;
        }
    }

    fn flush(&self, analyzed: &AnalyzedArtifact, group: &mut Vec<Piece>, chunks: &mut Vec<Chunk>) {
        if group.is_empty() {
            return;
        }
        let pieces = std::mem::take(group);
        let text = pieces
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return;
        }

        let start_line = pieces[0].start_line;
        let end_line = pieces[pieces.len() - 1].end_line;

        let mut symbols: Vec<String> = Vec::new();
        for symbol in pieces.iter().flat_map(|p| p.symbols.iter()) {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
        let parent_symbol = symbols
            .first()
            .cloned()
            .or_else(|| pieces.iter().find_map(|p| p.parent.clone()));

        let mut env_vars: Vec<String> = Vec::new();
        for annotation in &analyzed.annotations {
            if annotation.start_line < start_line || annotation.start_line > end_line {
                continue;
            }
            if let Some(name) = &annotation.symbol {
                if !env_vars.contains(name) {
                    env_vars.push(name.clone());
                }
            }
        }

        let checksum = format!("{:x}", Sha256::digest(text.as_bytes()));
        let id = chunk_id(&analyzed.path, start_line, &checksum);

        chunks.push(Chunk {
            id,
            path: analyzed.path.clone(),
            char_len: text.chars().count(),
            text,
            start_line,
            end_line,
            kind: analyzed.kind,
            language: analyzed.language.clone(),
            parent_symbol,
            symbols,
            env_vars,
            checksum,
            artifact_checksum: analyzed.checksum.clone(),
        });
    }
}

/// Split body fragments into units: each fragment that is not nested starts
/// a new unit.
fn units(body: &[Fragment]) -> Vec<&[Fragment]> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..body.len() {
        if !body[i].nested {
            out.push(&body[start..i]);
            start = i;
        }
    }
    if !body.is_empty() {
        out.push(&body[start..]);
    }
    out
}

/// Deterministic chunk id over path, start line and text checksum.
pub fn chunk_id(path: &str, start_line: usize, text_checksum: &str) -> String {
    let name = format!("{}:{}:{}", path, start_line, text_checksum);
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}
