//! Source record lifecycle and per-source ingestion locking.
//!
//! The [`SourceRegistry`] is the only writer of [`Source`] rows. It
//! enforces the crawl status machine (`pending → in_progress →
//! completed | failed`, with [`SourceRegistry::register`] as the one
//! sanctioned reset for an explicit re-crawl), cascades deletes through
//! the rows a source owns, and hands out per-source guards so two
//! ingestion runs can never interleave writes for the same source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::models::{CrawlStatus, OriginType, Source};
use crate::store::{Table, VectorStore};

/// Row counts removed by a cascading source delete.
#[derive(Debug, Clone, Copy)]
pub struct DeleteReport {
    pub chunks: u64,
    pub code_examples: u64,
}

pub struct SourceRegistry {
    store: Arc<dyn VectorStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SourceRegistry {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a pending source, or resets an existing one back to
    /// pending for an explicit re-crawl. Registration keeps the
    /// original creation time and preserves classification fields
    /// unless the caller supplies replacements.
    pub async fn register(
        &self,
        id: &str,
        title: &str,
        origin_type: OriginType,
        knowledge_type: Option<String>,
        tags: Vec<String>,
    ) -> Result<Source> {
        let now = Utc::now().timestamp();
        let source = match self.store.get_source(id).await? {
            Some(mut existing) => {
                existing.title = title.to_string();
                existing.crawl_status = CrawlStatus::Pending;
                if knowledge_type.is_some() {
                    existing.knowledge_type = knowledge_type;
                }
                if !tags.is_empty() {
                    existing.tags = tags;
                }
                existing.updated_at = now;
                existing
            }
            None => Source {
                id: id.to_string(),
                title: title.to_string(),
                summary: String::new(),
                origin_type,
                crawl_status: CrawlStatus::Pending,
                knowledge_type,
                tags,
                word_count: 0,
                created_at: now,
                updated_at: now,
            },
        };
        self.store.upsert_source(&source).await?;
        Ok(source)
    }

    pub async fn mark_in_progress(&self, id: &str) -> Result<()> {
        let source = self.checked_transition(id, CrawlStatus::InProgress).await?;
        self.store.upsert_source(&source).await
    }

    /// Completes a source, recording what indexing learned about it:
    /// total word count, an auto-extracted summary, and (when a better
    /// one was discovered) the page title.
    pub async fn mark_completed(
        &self,
        id: &str,
        word_count: i64,
        summary: &str,
        title: Option<&str>,
    ) -> Result<()> {
        let mut source = self.checked_transition(id, CrawlStatus::Completed).await?;
        source.word_count = word_count;
        source.summary = summary.to_string();
        if let Some(title) = title {
            if !title.trim().is_empty() {
                source.title = title.to_string();
            }
        }
        self.store.upsert_source(&source).await
    }

    pub async fn mark_failed(&self, id: &str) -> Result<()> {
        let source = self.checked_transition(id, CrawlStatus::Failed).await?;
        self.store.upsert_source(&source).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Source>> {
        self.store.get_source(id).await
    }

    pub async fn list(&self) -> Result<Vec<Source>> {
        self.store.list_sources().await
    }

    /// Deletes a source and everything it owns.
    ///
    /// The store guarantees no relational cascade, so owned rows go
    /// first: chunks, then code examples, then the source record. Holds
    /// the source's ingest guard so a delete cannot race an in-flight
    /// ingestion run.
    pub async fn delete(&self, id: &str) -> Result<DeleteReport> {
        let _guard = self.ingest_guard(id).await;
        self.store
            .get_source(id)
            .await?
            .with_context(|| format!("unknown source: {id}"))?;

        let chunks = self.store.delete_by_source(id, Table::Chunks).await?;
        let code_examples = self
            .store
            .delete_by_source(id, Table::CodeExamples)
            .await?;
        self.store.delete_source_record(id).await?;
        tracing::info!(source = id, chunks, code_examples, "deleted source");

        Ok(DeleteReport {
            chunks,
            code_examples,
        })
    }

    /// Acquires the per-source ingestion lock.
    ///
    /// Every ingestion run (and [`delete`](Self::delete)) holds the
    /// guard for its source id, serializing concurrent runs against the
    /// same source while leaving different sources fully parallel.
    pub async fn ingest_guard(&self, source_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn checked_transition(&self, id: &str, next: CrawlStatus) -> Result<Source> {
        let mut source = self
            .store
            .get_source(id)
            .await?
            .with_context(|| format!("unknown source: {id}"))?;
        if !source.crawl_status.can_transition_to(next) {
            bail!(
                "illegal crawl status transition {} -> {} for {id}",
                source.crawl_status.as_str(),
                next.as_str()
            );
        }
        source.crawl_status = next;
        source.updated_at = Utc::now().timestamp();
        Ok(source)
    }
}
