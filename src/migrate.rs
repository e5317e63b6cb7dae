use anyhow::Result;
use sqlx::SqlitePool;

/// Create the metadata schema. Every statement is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per ingested repository path
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            path TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            language TEXT NOT NULL,
            checksum TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            kind TEXT NOT NULL,
            language TEXT NOT NULL,
            parent_symbol TEXT,
            checksum TEXT NOT NULL,
            artifact_checksum TEXT NOT NULL,
            char_len INTEGER NOT NULL,
            text TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Symbol and env-var tags, many per chunk
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_tags (
            chunk_id TEXT NOT NULL,
            tag_type TEXT NOT NULL,
            value TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, tag_type, position),
            FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_kind_language ON chunks(kind, language)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_ingested_at ON chunks(ingested_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_tags_value ON chunk_tags(tag_type, value)")
        .execute(pool)
        .await?;

    Ok(())
}
