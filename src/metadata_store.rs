//! SQLite-backed store of chunk metadata keyed by chunk id.
//!
//! Three tables (see [`migrate`](crate::migrate)): `artifacts` (one row per
//! ingested path), `chunks` (one row per live chunk id, including its
//! text), and `chunk_tags` (symbol and env-var names per chunk).
//!
//! [`MetadataFilter`] is evaluated in SQL by [`MetadataStore::query`] and in
//! memory by [`MetadataFilter::matches`]; both apply the same predicates.

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db;
use crate::migrate;
use crate::models::{ArtifactKind, ArtifactRecord, MetadataRecord};

const TAG_SYMBOL: &str = "symbol";
const TAG_ENV_VAR: &str = "env_var";

/// Bound parameters per `IN (...)` list.
const ID_BATCH: usize = 500;

/// Structured predicates over [`MetadataRecord`]s. Unset fields match all.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataFilter {
    pub path: Option<String>,
    pub path_prefix: Option<String>,
    pub kind: Option<ArtifactKind>,
    pub language: Option<String>,
    /// Matches chunks defining this symbol.
    pub symbol: Option<String>,
    /// Matches chunks referencing this environment variable.
    pub env_var: Option<String>,
    pub checksum: Option<String>,
    /// Inclusive lower bound on `ingested_at`.
    pub ingested_after: Option<i64>,
    /// Exclusive upper bound on `ingested_at`.
    pub ingested_before: Option<i64>,
    /// Chunks ending before this line are excluded.
    pub min_line: Option<i64>,
    /// Chunks starting after this line are excluded.
    pub max_line: Option<i64>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, record: &MetadataRecord) -> bool {
        if let Some(path) = &self.path {
            if &record.path != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !record.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if record.kind != kind {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if &record.language != language {
                return false;
            }
        }
        if let Some(symbol) = &self.symbol {
            if !record.symbols.contains(symbol) {
                return false;
            }
        }
        if let Some(env_var) = &self.env_var {
            if !record.env_vars.contains(env_var) {
                return false;
            }
        }
        if let Some(checksum) = &self.checksum {
            if &record.checksum != checksum {
                return false;
            }
        }
        if let Some(after) = self.ingested_after {
            if record.ingested_at < after {
                return false;
            }
        }
        if let Some(before) = self.ingested_before {
            if record.ingested_at >= before {
                return false;
            }
        }
        if let Some(min_line) = self.min_line {
            if record.end_line < min_line {
                return false;
            }
        }
        if let Some(max_line) = self.max_line {
            if record.start_line > max_line {
                return false;
            }
        }
        true
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(path) = &self.path {
            qb.push(" AND path = ").push_bind(path.clone());
        }
        if let Some(prefix) = &self.path_prefix {
            qb.push(" AND substr(path, 1, length(")
                .push_bind(prefix.clone())
                .push(")) = ")
                .push_bind(prefix.clone());
        }
        if let Some(kind) = self.kind {
            qb.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(language) = &self.language {
            qb.push(" AND language = ").push_bind(language.clone());
        }
        for (tag_type, value) in [(TAG_SYMBOL, &self.symbol), (TAG_ENV_VAR, &self.env_var)] {
            if let Some(value) = value {
                qb.push(
                    " AND EXISTS (SELECT 1 FROM chunk_tags t \
                     WHERE t.chunk_id = chunks.chunk_id AND t.tag_type = ",
                )
                .push_bind(tag_type)
                .push(" AND t.value = ")
                .push_bind(value.clone())
                .push(")");
            }
        }
        if let Some(checksum) = &self.checksum {
            qb.push(" AND checksum = ").push_bind(checksum.clone());
        }
        if let Some(after) = self.ingested_after {
            qb.push(" AND ingested_at >= ").push_bind(after);
        }
        if let Some(before) = self.ingested_before {
            qb.push(" AND ingested_at < ").push_bind(before);
        }
        if let Some(min_line) = self.min_line {
            qb.push(" AND end_line >= ").push_bind(min_line);
        }
        if let Some(max_line) = self.max_line {
            qb.push(" AND start_line <= ").push_bind(max_line);
        }
    }
}

/// Row counts reported by `repoctx stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataStats {
    pub artifacts: i64,
    pub chunks: i64,
    pub total_chars: i64,
    pub by_kind: Vec<KindStats>,
    pub last_ingested_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindStats {
    pub kind: String,
    pub artifacts: i64,
    pub chunks: i64,
}

pub struct MetadataStore {
    pool: SqlitePool,
    /// Bumped after every committed write; part of the query-cache key.
    generation: AtomicU64,
}

const CHUNK_COLUMNS: &str = "chunk_id, path, start_line, end_line, kind, language, parent_symbol, \
     checksum, artifact_checksum, char_len, text, ingested_at";

impl MetadataStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            generation: AtomicU64::new(0),
        })
    }

    /// Number of committed writes since the store was opened.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert or replace one record together with its tags.
    pub async fn put(&self, record: &MetadataRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_record(&mut tx, record).await?;
        tx.commit().await?;
        self.bump();
        Ok(())
    }

    pub async fn get(&self, chunk_id: &str) -> Result<Option<MetadataRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE chunk_id = ?",
            CHUNK_COLUMNS
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut records = vec![record_from_row(&row)?];
                self.attach_tags(&mut records).await?;
                Ok(records.pop())
            }
            None => Ok(None),
        }
    }

    /// Records for every id that exists. Missing ids are simply absent.
    pub async fn get_many(&self, chunk_ids: &[String]) -> Result<HashMap<String, MetadataRecord>> {
        let mut records = Vec::with_capacity(chunk_ids.len());
        for batch in chunk_ids.chunks(ID_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {} FROM chunks WHERE chunk_id IN (",
                CHUNK_COLUMNS
            ));
            let mut separated = qb.separated(", ");
            for id in batch {
                separated.push_bind(id.clone());
            }
            qb.push(")");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                records.push(record_from_row(row)?);
            }
        }
        self.attach_tags(&mut records).await?;

        Ok(records
            .into_iter()
            .map(|r| (r.chunk_id.clone(), r))
            .collect())
    }

    /// All records matching `filter`, ordered by path then start line.
    pub async fn query(&self, filter: &MetadataFilter) -> Result<Vec<MetadataRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM chunks", CHUNK_COLUMNS));
        filter.push_where(&mut qb);
        qb.push(" ORDER BY path, start_line, chunk_id");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_tags(&mut records).await?;
        Ok(records)
    }

    pub async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_chunk(&mut tx, chunk_id).await?;
        tx.commit().await?;
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    pub async fn chunk_ids_for_path(&self, path: &str) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM chunks WHERE path = ? ORDER BY start_line, chunk_id")
                .bind(path)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    /// Every chunk id in the store, sorted.
    pub async fn all_chunk_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT chunk_id FROM chunks ORDER BY chunk_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Apply one artifact's re-ingestion in a single transaction: drop
    /// `stale_ids`, write `records`, and upsert the artifact row.
    pub async fn replace_artifact(
        &self,
        artifact: &ArtifactRecord,
        stale_ids: &[String],
        records: &[MetadataRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for id in stale_ids {
            delete_chunk(&mut tx, id).await?;
        }
        for record in records {
            insert_record(&mut tx, record).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO artifacts (path, kind, language, checksum, size_bytes, chunk_count, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                kind = excluded.kind,
                language = excluded.language,
                checksum = excluded.checksum,
                size_bytes = excluded.size_bytes,
                chunk_count = excluded.chunk_count,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&artifact.path)
        .bind(artifact.kind.as_str())
        .bind(&artifact.language)
        .bind(&artifact.checksum)
        .bind(artifact.size_bytes)
        .bind(artifact.chunk_count)
        .bind(artifact.ingested_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.bump();
        Ok(())
    }

    pub async fn artifact(&self, path: &str) -> Result<Option<ArtifactRecord>> {
        let row = sqlx::query(
            "SELECT path, kind, language, checksum, size_bytes, chunk_count, ingested_at \
             FROM artifacts WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(artifact_from_row).transpose()
    }

    /// All artifact rows, sorted by path.
    pub async fn artifacts(&self) -> Result<Vec<ArtifactRecord>> {
        let rows = sqlx::query(
            "SELECT path, kind, language, checksum, size_bytes, chunk_count, ingested_at \
             FROM artifacts ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    /// Remove an artifact row and all of its chunks. Returns the removed ids.
    pub async fn delete_artifact(&self, path: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query_scalar("SELECT chunk_id FROM chunks WHERE path = ?")
            .bind(path)
            .fetch_all(&mut *tx)
            .await?;
        for id in &ids {
            delete_chunk(&mut tx, id).await?;
        }
        sqlx::query("DELETE FROM artifacts WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.bump();
        Ok(ids)
    }

    pub async fn stats(&self) -> Result<MetadataStats> {
        let artifacts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let total_chars: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(char_len), 0) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let last_ingested_at: Option<i64> = sqlx::query_scalar("SELECT MAX(ingested_at) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT a.kind AS kind,
                   COUNT(*) AS artifacts,
                   COALESCE(SUM(a.chunk_count), 0) AS chunks
            FROM artifacts a
            GROUP BY a.kind
            ORDER BY chunks DESC, kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let by_kind = rows
            .iter()
            .map(|row| KindStats {
                kind: row.get("kind"),
                artifacts: row.get("artifacts"),
                chunks: row.get("chunks"),
            })
            .collect();

        Ok(MetadataStats {
            artifacts,
            chunks,
            total_chars,
            by_kind,
            last_ingested_at,
        })
    }

    async fn attach_tags(&self, records: &mut [MetadataRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut index: HashMap<String, usize> = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            index.insert(record.chunk_id.clone(), i);
        }

        let ids: Vec<String> = index.keys().cloned().collect();
        for batch in ids.chunks(ID_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT chunk_id, tag_type, value FROM chunk_tags WHERE chunk_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in batch {
                separated.push_bind(id.clone());
            }
            qb.push(") ORDER BY chunk_id, tag_type, position");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in rows {
                let chunk_id: String = row.get("chunk_id");
                let tag_type: String = row.get("tag_type");
                let value: String = row.get("value");
                let Some(&i) = index.get(&chunk_id) else {
                    continue;
                };
                match tag_type.as_str() {
                    TAG_SYMBOL => records[i].symbols.push(value),
                    TAG_ENV_VAR => records[i].env_vars.push(value),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

async fn insert_record(conn: &mut SqliteConnection, record: &MetadataRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO chunks (chunk_id, path, start_line, end_line, kind, language, parent_symbol,
                            checksum, artifact_checksum, char_len, text, ingested_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            path = excluded.path,
            start_line = excluded.start_line,
            end_line = excluded.end_line,
            kind = excluded.kind,
            language = excluded.language,
            parent_symbol = excluded.parent_symbol,
            checksum = excluded.checksum,
            artifact_checksum = excluded.artifact_checksum,
            char_len = excluded.char_len,
            text = excluded.text,
            ingested_at = excluded.ingested_at
        "#,
    )
    .bind(&record.chunk_id)
    .bind(&record.path)
    .bind(record.start_line)
    .bind(record.end_line)
    .bind(record.kind.as_str())
    .bind(&record.language)
    .bind(&record.parent_symbol)
    .bind(&record.checksum)
    .bind(&record.artifact_checksum)
    .bind(record.char_len)
    .bind(&record.text)
    .bind(record.ingested_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM chunk_tags WHERE chunk_id = ?")
        .bind(&record.chunk_id)
        .execute(&mut *conn)
        .await?;

    let tags = record
        .symbols
        .iter()
        .map(|s| (TAG_SYMBOL, s))
        .chain(record.env_vars.iter().map(|e| (TAG_ENV_VAR, e)));
    for (position, (tag_type, value)) in tags.enumerate() {
        sqlx::query(
            "INSERT INTO chunk_tags (chunk_id, tag_type, value, position) VALUES (?, ?, ?, ?)",
        )
        .bind(&record.chunk_id)
        .bind(tag_type)
        .bind(value)
        .bind(position as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn delete_chunk(conn: &mut SqliteConnection, chunk_id: &str) -> Result<bool> {
    sqlx::query("DELETE FROM chunk_tags WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM chunks WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn record_from_row(row: &SqliteRow) -> Result<MetadataRecord> {
    let kind: String = row.get("kind");
    Ok(MetadataRecord {
        chunk_id: row.get("chunk_id"),
        path: row.get("path"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        kind: kind.parse()?,
        language: row.get("language"),
        parent_symbol: row.get("parent_symbol"),
        symbols: Vec::new(),
        env_vars: Vec::new(),
        checksum: row.get("checksum"),
        artifact_checksum: row.get("artifact_checksum"),
        char_len: row.get("char_len"),
        text: row.get("text"),
        ingested_at: row.get("ingested_at"),
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<ArtifactRecord> {
    let kind: String = row.get("kind");
    Ok(ArtifactRecord {
        path: row.get("path"),
        kind: kind.parse()?,
        language: row.get("language"),
        checksum: row.get("checksum"),
        size_bytes: row.get("size_bytes"),
        chunk_count: row.get("chunk_count"),
        ingested_at: row.get("ingested_at"),
    })
}
