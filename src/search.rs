//! `repoctx search`: ranked retrieval printed for humans or as JSON.

use anyhow::Result;

use crate::engine::Engine;
use crate::metadata_store::MetadataFilter;
use crate::models::RetrievalResult;

const EXCERPT_CHARS: usize = 160;

pub async fn run_search(
    engine: &Engine,
    query: &str,
    top_k: usize,
    filters: &MetadataFilter,
    json: bool,
) -> Result<()> {
    let result = engine.retrieve(query, top_k, filters).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    print_results(&result);
    Ok(())
}

fn print_results(result: &RetrievalResult) {
    if result.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in result.iter().enumerate() {
        let r = &hit.record;
        let symbol = r.parent_symbol.as_deref().unwrap_or("-");
        println!(
            "{}. [{:.3}] {}:{}-{}  ({})",
            i + 1,
            hit.score,
            r.path,
            r.start_line,
            r.end_line,
            symbol
        );
        println!("    kind: {} / {}", r.kind, r.language);
        println!("    excerpt: \"{}\"", excerpt(&r.text));
        println!("    id: {}", r.chunk_id);
        println!();
    }
}

/// First `EXCERPT_CHARS` characters of `text` on one line.
pub fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}…", &flat[..idx]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_flattens_and_truncates() {
        assert_eq!(excerpt("fn a()\n{\n    1\n}"), "fn a() { 1 }");
        let long = "é".repeat(EXCERPT_CHARS + 10);
        let ex = excerpt(&long);
        assert_eq!(ex.chars().count(), EXCERPT_CHARS + 1);
        assert!(ex.ends_with('…'));
    }
}
