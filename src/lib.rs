//! # repo-context
//!
//! Retrieval and storage engine for answering questions about a software
//! repository.
//!
//! A repository checkout is crawled, each text file is analyzed into
//! fragments (definitions, documentation sections, environment variables),
//! fragments are packed into overlapping chunks, and every chunk is stored
//! twice: its vector in an exact-search [`vector_store`] and its text and
//! tags in a SQLite [`metadata_store`]. Queries are embedded, matched against
//! the vectors, joined with metadata, filtered, reranked and cached.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐
//! │ Crawler  │──▶│ Analyzer  │──▶│ Chunker │──▶│ Embedder │
//! │ walkdir  │   │ extract/* │   │         │   │          │
//! └──────────┘   └───────────┘   └─────────┘   └────┬─────┘
//!                                                   │
//!                                  ┌────────────────┴──┐
//!                                  ▼                   ▼
//!                           ┌─────────────┐    ┌──────────────┐
//!                           │ VectorStore │    │ MetadataStore│
//!                           │  (binary)   │    │   (SQLite)   │
//!                           └──────┬──────┘    └──────┬───────┘
//!                                  └────────┬─────────┘
//!                                           ▼
//!                    ┌───────────┐   ┌─────────────┐   ┌───────────┐
//!                    │ QueryProc │──▶│  Retriever  │──▶│ Generator │
//!                    │  (query)  │   │ + LRU cache │   │ (LLM API) │
//!                    └───────────┘   └─────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! repoctx init
//! repoctx ingest --root .
//! repoctx search "how is the database pool configured"
//! repoctx ask "which environment variables are required?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed error kinds |
//! | [`crawler`] | Repository walk and file classification |
//! | [`extract`] | Per-kind fragment extractors |
//! | [`analyzer`] | Dispatch of artifacts to extractors |
//! | [`chunk`] | Fragment packing into overlapping chunks |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_store`] | Persistent exact nearest-neighbour index |
//! | [`metadata_store`] | SQLite chunk records and filters |
//! | [`cache`] | Single-flight LRU cache |
//! | [`query`] | Query intent and entity analysis |
//! | [`retrieve`] | Ranked context retrieval |
//! | [`generate`] | Completion providers and answer formatting |
//! | [`ingest`] | Full and incremental ingestion |
//! | [`engine`] | Session handle wiring the pieces together |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analyzer;
pub mod ask;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod crawler;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generate;
pub mod get;
pub mod ingest;
pub mod metadata_store;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod retrieve;
pub mod search;
pub mod stats;
pub mod vector_store;
