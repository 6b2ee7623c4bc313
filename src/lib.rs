//! # Quarry
//!
//! A web-crawling knowledge engine with hybrid retrieval for AI agents.
//!
//! Quarry ingests documentation sites (and local files) into a SQLite
//! knowledge base: pages are crawled in parallel, chunked with
//! code-fence awareness, embedded in batches, and stored alongside an
//! FTS5 keyword index. Retrieval merges vector and keyword rankings and
//! can refine the order with a cross-encoder reranker.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌───────────┐
//! │   Fetcher     │──▶│   Pipeline     │──▶│  SQLite    │
//! │ crawl/sitemap │   │ chunk + embed │   │ FTS5 + vec │
//! └──────────────┘   └───────────────┘   └─────┬─────┘
//!                                              │
//!                                        ┌─────┴──────┐
//!                                        │  SearchEngine │
//!                                        │ hybrid+rerank │
//!                                        └─────┬──────┘
//!                                              │
//!                                         CLI (quarry)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! quarry init                                # create database
//! quarry crawl https://docs.example.com      # ingest a site
//! quarry upload ./notes.md                   # ingest a local file
//! quarry search "connection pooling"         # query the knowledge base
//! quarry sources                             # list what is indexed
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and feature flags |
//! | [`models`] | Core data types |
//! | [`fetcher`] | HTTP fetching, sitemap expansion, parallel crawling |
//! | [`chunker`] | Code-aware text chunking |
//! | [`extract`] | Text extraction for uploaded files |
//! | [`embedding`] | Embedding providers, batching, retry |
//! | [`indexer`] | Hash-deduplicated incremental indexing |
//! | [`ingest`] | Pipeline orchestration |
//! | [`registry`] | Source lifecycle and ingestion locking |
//! | [`search`] | Vector, hybrid, and reranked retrieval |
//! | [`reranker`] | Cross-encoder result reranking |
//! | [`store`] | Vector store abstraction (SQLite, in-memory) |
//! | [`progress`] | Ingestion progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Knowledge base statistics |

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod fetcher;
pub mod indexer;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod registry;
pub mod reranker;
pub mod search;
pub mod stats;
pub mod store;
