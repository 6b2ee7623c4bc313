//! Storage abstraction for Quarry.
//!
//! The [`VectorStore`] trait defines every operation the ingestion and
//! retrieval pipeline needs from a vector-capable document store,
//! enabling pluggable backends (SQLite, in-memory). An empty result is
//! always a valid "no rows", never an error.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, CodeExample, Source};

/// Which embedding space an operation targets. Prose chunks and code
/// examples are embedded and ranked in separate spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Chunks,
    CodeExamples,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Chunks => "chunks",
            Table::CodeExamples => "code_examples",
        }
    }
}

/// Metadata-equality filters applied inside the store.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub source_id: Option<String>,
    pub knowledge_type: Option<String>,
}

impl SearchFilter {
    pub fn by_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            knowledge_type: None,
        }
    }

    /// Predicate form, used by the in-memory driver.
    pub fn matches(&self, source_id: &str, knowledge_type: Option<&str>) -> bool {
        if let Some(want) = &self.source_id {
            if want != source_id {
                return false;
            }
        }
        if let Some(want) = &self.knowledge_type {
            if knowledge_type != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A candidate row returned from keyword or vector search.
///
/// Carries the denormalized metadata so hybrid merging and result
/// display need no additional round-trips.
#[derive(Debug, Clone)]
pub struct MatchRow {
    /// Chunk or code-example UUID.
    pub id: String,
    pub source_id: String,
    pub url: String,
    /// Chunk content, or the code block for code-example rows.
    pub content: String,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
    /// Raw score from the search backend (cosine similarity or negated
    /// FTS rank). Comparable only within one result list.
    pub raw_score: f32,
}

/// Abstract vector-capable document store.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_source`](VectorStore::upsert_source) | Insert or replace a source record |
/// | [`get_source`](VectorStore::get_source) / [`list_sources`](VectorStore::list_sources) | Read source records |
/// | [`delete_source_record`](VectorStore::delete_source_record) | Remove a source row |
/// | [`insert_chunks`](VectorStore::insert_chunks) | Append chunk rows with embeddings |
/// | [`insert_code_examples`](VectorStore::insert_code_examples) | Append code-example rows |
/// | [`delete_by_source`](VectorStore::delete_by_source) | Delete one table's rows for a source |
/// | [`select_hashes_by_source`](VectorStore::select_hashes_by_source) | Content hashes already indexed |
/// | [`similarity_search`](VectorStore::similarity_search) | Cosine similarity query |
/// | [`keyword_search`](VectorStore::keyword_search) | Full-text keyword query |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert a source record, replacing any existing row with the same
    /// id.
    async fn upsert_source(&self, source: &Source) -> Result<()>;

    async fn get_source(&self, source_id: &str) -> Result<Option<Source>>;

    /// All source records, ordered by creation time then id.
    async fn list_sources(&self) -> Result<Vec<Source>>;

    /// Remove the source row itself. Owned chunk and code-example rows
    /// must already have been deleted via
    /// [`delete_by_source`](VectorStore::delete_by_source).
    async fn delete_source_record(&self, source_id: &str) -> Result<()>;

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    async fn insert_code_examples(&self, examples: &[CodeExample]) -> Result<()>;

    /// Delete one table's rows owned by a source. Returns the number of
    /// rows removed.
    async fn delete_by_source(&self, source_id: &str, table: Table) -> Result<u64>;

    /// Content hashes of chunks already stored for a source.
    async fn select_hashes_by_source(&self, source_id: &str) -> Result<HashSet<String>>;

    /// Top `limit` rows by cosine similarity to `embedding`, descending.
    async fn similarity_search(
        &self,
        table: Table,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MatchRow>>;

    /// Top `limit` rows by full-text relevance to `query`, descending.
    async fn keyword_search(
        &self,
        table: Table,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MatchRow>>;
}
