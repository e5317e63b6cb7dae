//! End-to-end ingestion and retrieval through the library API.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use repo_context::config::Config;
use repo_context::embedding::HashEmbedder;
use repo_context::engine::Engine;
use repo_context::ingest::IngestMode;
use repo_context::metadata_store::MetadataFilter;
use repo_context::models::ArtifactKind;
use tempfile::TempDir;

const TARGET_FN: &str = "reconcile_ledger_balances";

struct Fixture {
    repo: TempDir,
    data: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            repo: TempDir::new().unwrap(),
            data: TempDir::new().unwrap(),
        };
        fixture.write("src/ledger.rs", &ledger_source());
        fixture.write("README.md", &readme());
        fixture
    }

    fn config(&self) -> Config {
        Config::with_storage_root(self.data.path())
    }

    async fn engine(&self) -> Engine {
        let config = self.config();
        let embedder = Arc::new(HashEmbedder::new(config.embedding.dims));
        Engine::open(config, embedder).await.unwrap()
    }

    fn root(&self) -> &Path {
        self.repo.path()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.repo.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// 500 lines of Rust with one distinctive function among many helpers.
fn ledger_source() -> String {
    let mut lines: Vec<String> = vec![
        "//! Ledger helpers.".to_string(),
        String::new(),
        format!("pub fn {}(entries: &[i64]) -> i64 {{", TARGET_FN),
        "    let total: i64 = entries.iter().sum();".to_string(),
        "    total".to_string(),
        "}".to_string(),
        String::new(),
    ];
    let mut i = 0;
    while lines.len() + 4 <= 500 {
        lines.push(format!("pub fn helper_{}(x: u32) -> u32 {{", i));
        lines.push(format!("    x.wrapping_add({})", i));
        lines.push("}".to_string());
        lines.push(String::new());
        i += 1;
    }
    while lines.len() < 500 {
        lines.push("// end".to_string());
    }
    let mut text = lines.join("\n");
    text.push('\n');
    text
}

/// 50 lines of prose under one heading.
fn readme() -> String {
    let mut text = String::from("# Project\n");
    for i in 1..50 {
        text.push_str(&format!("Line {} of the overview.\n", i));
    }
    text
}

fn only_path(path: &str) -> MetadataFilter {
    MetadataFilter {
        path: Some(path.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_source_and_readme_chunking_and_top_hit() {
    let fx = Fixture::new();
    assert_eq!(ledger_source().lines().count(), 500);
    assert_eq!(readme().lines().count(), 50);

    let engine = fx.engine().await;
    let report = engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    assert_eq!(report.artifacts_seen, 2);
    assert!(report.failures.is_empty());

    let source_chunks = engine.metadata().query(&only_path("src/ledger.rs")).await.unwrap();
    let readme_chunks = engine.metadata().query(&only_path("README.md")).await.unwrap();
    assert!(source_chunks.len() > 1, "source chunks: {}", source_chunks.len());
    assert_eq!(readme_chunks.len(), 1);
    assert!(source_chunks.iter().all(|r| r.kind == ArtifactKind::Code));
    assert_eq!(readme_chunks[0].kind, ArtifactKind::Doc);

    let question = format!("what does function {} do", TARGET_FN);
    let result = engine
        .retrieve(&question, 5, &MetadataFilter::default())
        .await
        .unwrap();
    let top = result.top().expect("at least one hit");
    assert_eq!(top.record.path, "src/ledger.rs");
    assert!(top.record.text.contains(TARGET_FN));
    assert!(result.len() <= 5);

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_every_vector_has_a_metadata_record() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();

    let ids = engine.metadata().all_chunk_ids().await.unwrap();
    assert_eq!(ids, engine.vectors().chunk_ids());
    for record in engine.metadata().query(&MetadataFilter::default()).await.unwrap() {
        let vector = engine.vectors().get(&record.chunk_id).unwrap();
        assert_eq!(vector.len(), engine.vectors().dims());
    }
}

#[tokio::test]
async fn test_reingest_unchanged_repo_is_noop() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    let ids_before = engine.vectors().chunk_ids();
    let generation = engine.vectors().generation();

    let report = engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    assert_eq!(report.artifacts_processed, 0);
    assert_eq!(report.artifacts_unchanged, 2);
    assert_eq!(report.chunks_added, 0);
    assert_eq!(report.chunks_removed, 0);
    assert_eq!(engine.vectors().chunk_ids(), ids_before);
    assert_eq!(engine.vectors().generation(), generation);

    // A full pass rewrites nothing either.
    let report = engine.ingest(fx.root(), IngestMode::Full).await.unwrap();
    assert_eq!(report.chunks_added, 0);
    assert_eq!(report.embeddings_repaired, 0);
    assert_eq!(engine.vectors().chunk_ids(), ids_before);
}

#[tokio::test]
async fn test_deleted_file_is_removed_incrementally() {
    let fx = Fixture::new();
    fx.write("docs/setup.md", "# Setup\n\nExport DATABASE_URL before starting.\n");
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();

    let setup_ids = engine.metadata().chunk_ids_for_path("docs/setup.md").await.unwrap();
    assert!(!setup_ids.is_empty());

    fs::remove_file(fx.root().join("docs/setup.md")).unwrap();
    let report = engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    assert_eq!(report.artifacts_removed, 1);
    assert_eq!(report.chunks_removed, setup_ids.len());

    assert!(engine.metadata().query(&only_path("docs/setup.md")).await.unwrap().is_empty());
    assert!(engine.metadata().artifact("docs/setup.md").await.unwrap().is_none());
    for id in &setup_ids {
        assert!(!engine.vectors().contains(id));
    }

    let result = engine
        .retrieve("DATABASE_URL setup", 10, &MetadataFilter::default())
        .await
        .unwrap();
    assert!(result.iter().all(|hit| hit.record.path != "docs/setup.md"));
}

#[tokio::test]
async fn test_modified_file_replaces_only_changed_chunks() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    let source_ids = engine.metadata().chunk_ids_for_path("src/ledger.rs").await.unwrap();

    fx.write("README.md", "# Project\n\nRewritten overview mentioning settlement.\n");
    let report = engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    assert_eq!(report.artifacts_processed, 1);
    assert_eq!(report.chunks_added, 1);
    assert_eq!(report.chunks_removed, 1);

    assert_eq!(
        engine.metadata().chunk_ids_for_path("src/ledger.rs").await.unwrap(),
        source_ids
    );
    let readme = engine.metadata().query(&only_path("README.md")).await.unwrap();
    assert_eq!(readme.len(), 1);
    assert!(readme[0].text.contains("settlement"));
}

#[tokio::test]
async fn test_filter_matching_nothing_returns_empty() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();

    let filters = MetadataFilter {
        path_prefix: Some("vendor/".to_string()),
        ..Default::default()
    };
    let result = engine.retrieve(TARGET_FN, 5, &filters).await.unwrap();
    assert!(result.is_empty());

    let docs_only = MetadataFilter {
        kind: Some(ArtifactKind::Doc),
        ..Default::default()
    };
    let result = engine.retrieve(TARGET_FN, 5, &docs_only).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.top().unwrap().record.path, "README.md");
}

#[tokio::test]
async fn test_ranking_is_stable_across_calls_and_reopen() {
    let fx = Fixture::new();
    let query = "ledger helper wrapping_add";

    let first = {
        let engine = fx.engine().await;
        engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
        let a = engine.retrieve(query, 6, &MetadataFilter::default()).await.unwrap();
        let b = engine.retrieve(query, 6, &MetadataFilter::default()).await.unwrap();
        assert_eq!(a, b);
        let (_, query_stats) = engine.cache_stats();
        assert_eq!(query_stats.hits, 1);
        engine.close().await.unwrap();
        a
    };

    let engine = fx.engine().await;
    let again = engine.retrieve(query, 6, &MetadataFilter::default()).await.unwrap();
    assert_eq!(first.chunk_ids(), again.chunk_ids());
    for pair in again.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn test_index_survives_reopen() {
    let fx = Fixture::new();
    let (ids, records) = {
        let engine = fx.engine().await;
        engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
        let ids = engine.vectors().chunk_ids();
        let records = engine.metadata().query(&MetadataFilter::default()).await.unwrap();
        engine.close().await.unwrap();
        (ids, records)
    };
    assert!(!ids.is_empty());

    let engine = fx.engine().await;
    assert_eq!(engine.vectors().chunk_ids(), ids);
    assert_eq!(
        engine.metadata().query(&MetadataFilter::default()).await.unwrap(),
        records
    );

    // Nothing changed on disk, so nothing is reprocessed.
    let report = engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();
    assert_eq!(report.artifacts_processed, 0);
}

#[tokio::test]
async fn test_vector_without_record_is_skipped() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();

    let readme_id = engine.metadata().chunk_ids_for_path("README.md").await.unwrap()[0].clone();
    assert!(engine.metadata().delete(&readme_id).await.unwrap());
    assert!(engine.vectors().contains(&readme_id));

    let result = engine
        .retrieve("overview of the project", 20, &MetadataFilter::default())
        .await
        .unwrap();
    assert!(!result.is_empty());
    assert!(result.iter().all(|hit| hit.record.chunk_id != readme_id));

    // A full ingest restores the record and drops nothing else.
    let report = engine.ingest(fx.root(), IngestMode::Full).await.unwrap();
    assert!(report.failures.is_empty());
    assert!(engine.metadata().get(&readme_id).await.unwrap().is_some());
    assert_eq!(
        engine.metadata().all_chunk_ids().await.unwrap(),
        engine.vectors().chunk_ids()
    );
}

#[tokio::test]
async fn test_repeated_query_sees_deleted_record() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.ingest(fx.root(), IngestMode::Incremental).await.unwrap();

    let question = format!("what does function {} do", TARGET_FN);
    let before = engine
        .retrieve(&question, 5, &MetadataFilter::default())
        .await
        .unwrap();
    let top_id = before.top().unwrap().record.chunk_id.clone();

    assert!(engine.metadata().delete(&top_id).await.unwrap());
    let after = engine
        .retrieve(&question, 5, &MetadataFilter::default())
        .await
        .unwrap();
    assert!(after.iter().all(|hit| hit.record.chunk_id != top_id));
    assert!(!after.is_empty());
}

#[tokio::test]
async fn test_concurrent_ingests_and_flush_leave_a_loadable_index() {
    let fx = Fixture::new();
    for i in 0..20 {
        fx.write(
            &format!("src/mod_{:02}.rs", i),
            &format!("pub fn handler_{i}(n: u32) -> u32 {{\n    n + {i}\n}}\n"),
        );
    }
    let ids = {
        let engine = fx.engine().await;
        let (a, b, c) = tokio::join!(
            engine.ingest(fx.root(), IngestMode::Incremental),
            engine.ingest(fx.root(), IngestMode::Full),
            engine.vectors().flush(),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        engine.close().await.unwrap();
        engine.vectors().chunk_ids()
    };
    assert!(!fx.data.path().join("vectors.idx.tmp").exists());

    let engine = fx.engine().await;
    assert_eq!(engine.vectors().chunk_ids(), ids);
}
