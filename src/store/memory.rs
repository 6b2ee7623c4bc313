//! In-memory [`VectorStore`] implementation for tests and library use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread
//! safety. Vector search is brute-force cosine similarity over all
//! stored rows; keyword search is case-insensitive term containment
//! scored by matching-term count.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, CodeExample, Source};

use super::{MatchRow, SearchFilter, Table, VectorStore};

/// In-memory store. Cheap to construct, fully isolated per instance.
pub struct InMemoryStore {
    sources: RwLock<HashMap<String, Source>>,
    chunks: RwLock<Vec<Chunk>>,
    code_examples: RwLock<Vec<CodeExample>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            chunks: RwLock::new(Vec::new()),
            code_examples: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Count of query terms contained in `text`, case-insensitive. Zero
/// means no match.
fn term_match_score(terms: &[String], text: &str) -> usize {
    let text_lower = text.to_lowercase();
    terms.iter().filter(|t| text_lower.contains(t.as_str())).count()
}

fn sort_and_truncate(mut rows: Vec<MatchRow>, limit: usize) -> Vec<MatchRow> {
    rows.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    rows.truncate(limit);
    rows
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        let mut sources = self.sources.write().unwrap();
        sources.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let sources = self.sources.read().unwrap();
        Ok(sources.get(source_id).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        let sources = self.sources.read().unwrap();
        let mut all: Vec<Source> = sources.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn delete_source_record(&self, source_id: &str) -> Result<()> {
        let mut sources = self.sources.write().unwrap();
        sources.remove(source_id);
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        stored.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn insert_code_examples(&self, examples: &[CodeExample]) -> Result<()> {
        let mut stored = self.code_examples.write().unwrap();
        stored.extend(examples.iter().cloned());
        Ok(())
    }

    async fn delete_by_source(&self, source_id: &str, table: Table) -> Result<u64> {
        match table {
            Table::Chunks => {
                let mut stored = self.chunks.write().unwrap();
                let before = stored.len();
                stored.retain(|c| c.source_id != source_id);
                Ok((before - stored.len()) as u64)
            }
            Table::CodeExamples => {
                let mut stored = self.code_examples.write().unwrap();
                let before = stored.len();
                stored.retain(|e| e.source_id != source_id);
                Ok((before - stored.len()) as u64)
            }
        }
    }

    async fn select_hashes_by_source(&self, source_id: &str) -> Result<HashSet<String>> {
        let stored = self.chunks.read().unwrap();
        Ok(stored
            .iter()
            .filter(|c| c.source_id == source_id)
            .map(|c| c.content_hash.clone())
            .collect())
    }

    async fn similarity_search(
        &self,
        table: Table,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MatchRow>> {
        let rows: Vec<MatchRow> = match table {
            Table::Chunks => {
                let stored = self.chunks.read().unwrap();
                stored
                    .iter()
                    .filter(|c| filter.matches(&c.source_id, c.knowledge_type.as_deref()))
                    .map(|c| MatchRow {
                        id: c.id.clone(),
                        source_id: c.source_id.clone(),
                        url: c.url.clone(),
                        content: c.content.clone(),
                        knowledge_type: c.knowledge_type.clone(),
                        tags: c.tags.clone(),
                        raw_score: cosine_similarity(embedding, &c.embedding),
                    })
                    .collect()
            }
            Table::CodeExamples => {
                let stored = self.code_examples.read().unwrap();
                stored
                    .iter()
                    .filter(|e| filter.matches(&e.source_id, e.knowledge_type.as_deref()))
                    .map(|e| MatchRow {
                        id: e.id.clone(),
                        source_id: e.source_id.clone(),
                        url: e.url.clone(),
                        content: e.code_block.clone(),
                        knowledge_type: e.knowledge_type.clone(),
                        tags: e.tags.clone(),
                        raw_score: cosine_similarity(embedding, &e.embedding),
                    })
                    .collect()
            }
        };
        Ok(sort_and_truncate(rows, limit))
    }

    async fn keyword_search(
        &self,
        table: Table,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<MatchRow>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|t| t.to_string())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<MatchRow> = match table {
            Table::Chunks => {
                let stored = self.chunks.read().unwrap();
                stored
                    .iter()
                    .filter(|c| filter.matches(&c.source_id, c.knowledge_type.as_deref()))
                    .filter_map(|c| {
                        let score = term_match_score(&terms, &c.content);
                        if score == 0 {
                            return None;
                        }
                        Some(MatchRow {
                            id: c.id.clone(),
                            source_id: c.source_id.clone(),
                            url: c.url.clone(),
                            content: c.content.clone(),
                            knowledge_type: c.knowledge_type.clone(),
                            tags: c.tags.clone(),
                            raw_score: score as f32,
                        })
                    })
                    .collect()
            }
            Table::CodeExamples => {
                let stored = self.code_examples.read().unwrap();
                stored
                    .iter()
                    .filter(|e| filter.matches(&e.source_id, e.knowledge_type.as_deref()))
                    .filter_map(|e| {
                        let haystack = format!("{}\n{}", e.summary, e.code_block);
                        let score = term_match_score(&terms, &haystack);
                        if score == 0 {
                            return None;
                        }
                        Some(MatchRow {
                            id: e.id.clone(),
                            source_id: e.source_id.clone(),
                            url: e.url.clone(),
                            content: e.code_block.clone(),
                            knowledge_type: e.knowledge_type.clone(),
                            tags: e.tags.clone(),
                            raw_score: score as f32,
                        })
                    })
                    .collect()
            }
        };
        Ok(sort_and_truncate(rows, limit))
    }
}
