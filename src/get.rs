//! `repoctx get`: print one chunk's metadata record and text.

use anyhow::{bail, Result};

use crate::engine::Engine;
use crate::stats::format_ts_relative;

pub async fn run_get(engine: &Engine, chunk_id: &str, json: bool) -> Result<()> {
    let Some(record) = engine.metadata().get(chunk_id).await? else {
        bail!("chunk not found: {}", chunk_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let embedded = engine.vectors().contains(&record.chunk_id);

    println!("--- Chunk ---");
    println!("id:           {}", record.chunk_id);
    println!("path:         {}", record.path);
    println!("lines:        {}-{}", record.start_line, record.end_line);
    println!("kind:         {} / {}", record.kind, record.language);
    if let Some(ref symbol) = record.parent_symbol {
        println!("symbol:       {}", symbol);
    }
    if !record.symbols.is_empty() {
        println!("defines:      {}", record.symbols.join(", "));
    }
    if !record.env_vars.is_empty() {
        println!("env vars:     {}", record.env_vars.join(", "));
    }
    println!("checksum:     {}", record.checksum);
    println!("ingested:     {}", format_ts_relative(record.ingested_at));
    println!("embedded:     {}", if embedded { "yes" } else { "no" });
    println!();

    println!("--- Text ({} chars) ---", record.char_len);
    println!("{}", record.text);

    Ok(())
}
