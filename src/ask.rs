//! `repoctx ask`: retrieve context for a question and answer it with the
//! configured completion provider.

use anyhow::Result;

use crate::engine::Engine;
use crate::generate::ResponseGenerator;
use crate::metadata_store::MetadataFilter;

pub async fn run_ask(
    engine: &Engine,
    question: &str,
    top_k: usize,
    filters: &MetadataFilter,
    json: bool,
) -> Result<()> {
    let generator = ResponseGenerator::from_config(&engine.config().completion)?;
    let context = engine.retrieve(question, top_k, filters).await?;
    let response = generator.generate(question, &context).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.answer);
    if !response.sources.is_empty() {
        println!();
        println!("--- Context ---");
        for (i, source) in response.sources.iter().enumerate() {
            println!(
                "[{}] {}:{}-{}  {}",
                i + 1,
                source.path,
                source.start_line,
                source.end_line,
                source.chunk_id
            );
        }
    }
    Ok(())
}
