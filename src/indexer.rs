//! Incremental indexing of chunks and code examples.
//!
//! The [`Indexer`] turns chunker output into stored rows: it hashes
//! normalized content, skips hashes already indexed for the source
//! (re-running an ingestion is idempotent), embeds every fresh text in
//! one batched provider call, and inserts rows carrying denormalized
//! source metadata so search results need no join.
//!
//! Store failures propagate without rollback; the hash dedup makes a
//! re-run converge instead of duplicating rows.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::chunker::{extract_section_info, CodeBlock};
use crate::embedding::EmbeddingClient;
use crate::models::{Chunk, CodeExample, PendingChunk};
use crate::progress::{IngestPhase, ProgressEvent, ProgressReporter, CHUNK_CEILING};
use crate::store::VectorStore;

/// Source metadata denormalized onto every stored row.
#[derive(Debug, Clone, Default)]
pub struct IndexMeta {
    /// Source title, used as the context prefix for contextual
    /// embeddings.
    pub source_title: String,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
    /// When set, the text sent to the embedding provider is prefixed
    /// with the source title and the chunk's heading trail. Stored
    /// content is unchanged.
    pub contextual_embeddings: bool,
}

/// What one indexing invocation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexOutcome {
    pub stored: usize,
    pub skipped: usize,
}

/// A code block waiting to be embedded and stored.
#[derive(Debug, Clone)]
pub struct PendingCodeExample {
    /// Page the block came from.
    pub url: String,
    pub block: CodeBlock,
}

/// SHA-256 hex of normalized content: trimmed, CRLF folded to LF.
/// The dedup key for incremental indexing.
pub fn content_hash(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct Indexer {
    store: Arc<dyn VectorStore>,
    embedder: EmbeddingClient,
}

impl Indexer {
    pub fn new(store: Arc<dyn VectorStore>, embedder: EmbeddingClient) -> Self {
        Self { store, embedder }
    }

    /// Index chunker output for one source.
    ///
    /// Chunks whose content hash already exists for `source_id` are
    /// skipped, as are duplicates within the incoming batch. All fresh
    /// contents are embedded in a single provider round trip, then
    /// inserted together.
    ///
    /// # Errors
    ///
    /// Fails when the batched embedding call exhausts its retries or
    /// the store insert fails. Nothing is rolled back; a re-run skips
    /// whatever was already inserted.
    pub async fn index_chunks(
        &self,
        source_id: &str,
        chunks: &[PendingChunk],
        meta: &IndexMeta,
        progress: &dyn ProgressReporter,
    ) -> Result<IndexOutcome> {
        if chunks.is_empty() {
            return Ok(IndexOutcome::default());
        }

        let mut seen: HashSet<String> = self
            .store
            .select_hashes_by_source(source_id)
            .await
            .context("failed to load existing content hashes")?;

        let mut fresh: Vec<(&PendingChunk, String)> = Vec::new();
        let mut skipped = 0usize;
        for chunk in chunks {
            let hash = content_hash(&chunk.content);
            if seen.insert(hash.clone()) {
                fresh.push((chunk, hash));
            } else {
                skipped += 1;
            }
        }

        progress.report(ProgressEvent::new(
            IngestPhase::Indexing,
            CHUNK_CEILING,
            format!("embedding {} chunks ({} already indexed)", fresh.len(), skipped),
        ));

        if fresh.is_empty() {
            progress.report(ProgressEvent::new(IngestPhase::Indexing, 100, "nothing new to index"));
            return Ok(IndexOutcome { stored: 0, skipped });
        }

        let infos: Vec<_> = fresh
            .iter()
            .map(|(chunk, _)| extract_section_info(&chunk.content))
            .collect();

        let texts: Vec<String> = fresh
            .iter()
            .zip(&infos)
            .map(|((chunk, _), info)| {
                if meta.contextual_embeddings {
                    contextual_text(&meta.source_title, &info.headers, &chunk.content)
                } else {
                    chunk.content.clone()
                }
            })
            .collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let now = Utc::now().timestamp();
        let rows: Vec<Chunk> = fresh
            .iter()
            .zip(infos)
            .zip(embeddings)
            .map(|(((chunk, hash), info), embedding)| Chunk {
                id: Uuid::new_v4().to_string(),
                source_id: source_id.to_string(),
                url: chunk.url.clone(),
                content: chunk.content.clone(),
                embedding,
                content_hash: hash.clone(),
                headers: info.headers,
                knowledge_type: meta.knowledge_type.clone(),
                tags: meta.tags.clone(),
                char_count: info.char_count as i64,
                word_count: info.word_count as i64,
                created_at: now,
            })
            .collect();

        self.store
            .insert_chunks(&rows)
            .await
            .context("failed to insert chunks")?;

        progress.report(ProgressEvent::new(
            IngestPhase::Indexing,
            100,
            format!("indexed {} chunks, skipped {}", rows.len(), skipped),
        ));
        tracing::debug!(source = source_id, stored = rows.len(), skipped, "indexed chunks");

        Ok(IndexOutcome {
            stored: rows.len(),
            skipped,
        })
    }

    /// Embed and store extracted code examples for one source.
    ///
    /// The embedded text is the block's summary followed by the code,
    /// so natural-language queries land near the right examples. One
    /// provider call covers the whole batch. Returns the stored count.
    pub async fn store_code_examples(
        &self,
        source_id: &str,
        examples: &[PendingCodeExample],
        meta: &IndexMeta,
    ) -> Result<usize> {
        if examples.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = examples
            .iter()
            .map(|example| format!("{}\n\n{}", example.block.summarize(), example.block.code))
            .collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let now = Utc::now().timestamp();
        let rows: Vec<CodeExample> = examples
            .iter()
            .zip(embeddings)
            .map(|(example, embedding)| CodeExample {
                id: Uuid::new_v4().to_string(),
                source_id: source_id.to_string(),
                url: example.url.clone(),
                code_block: example.block.code.clone(),
                summary: example.block.summarize(),
                embedding,
                knowledge_type: meta.knowledge_type.clone(),
                tags: meta.tags.clone(),
                created_at: now,
            })
            .collect();

        self.store
            .insert_code_examples(&rows)
            .await
            .context("failed to insert code examples")?;
        tracing::debug!(source = source_id, stored = rows.len(), "stored code examples");

        Ok(rows.len())
    }
}

/// The text actually embedded when contextual embeddings are on:
/// source title and heading trail, then the chunk content.
fn contextual_text(title: &str, headers: &[String], content: &str) -> String {
    let mut prefix = String::new();
    if !title.trim().is_empty() {
        prefix.push_str(title.trim());
    }
    for header in headers {
        if !prefix.is_empty() {
            prefix.push_str(" > ");
        }
        prefix.push_str(header.trim_start_matches('#').trim());
    }
    if prefix.is_empty() {
        content.to_string()
    } else {
        format!("{}\n\n{}", prefix, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbedError, EmbeddingProvider, RetryPolicy};
    use crate::progress::NoProgress;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Counts provider calls and records the texts it was asked to
    /// embed.
    struct RecordingProvider {
        calls: AtomicUsize,
        texts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingProvider {
        fn model_name(&self) -> &str {
            "recording"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbedError::Permanent("provider down".to_string()));
            }
            self.texts.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn fast_client(provider: Arc<RecordingProvider>) -> EmbeddingClient {
        EmbeddingClient::new(provider, RetryPolicy::new(1, Duration::from_millis(0), 1))
    }

    fn pending(url: &str, content: &str) -> PendingChunk {
        PendingChunk {
            url: url.to_string(),
            content: content.to_string(),
        }
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<RecordingProvider>, Indexer) {
        let store = Arc::new(InMemoryStore::default());
        let provider = Arc::new(RecordingProvider::new());
        let indexer = Indexer::new(store.clone(), fast_client(provider.clone()));
        (store, provider, indexer)
    }

    #[test]
    fn test_content_hash_normalizes_whitespace() {
        assert_eq!(content_hash("hello\nworld"), content_hash("hello\r\nworld"));
        assert_eq!(content_hash("  hello  "), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
    }

    #[tokio::test]
    async fn test_index_stores_rows_with_metadata() {
        let (store, _, indexer) = setup();
        let meta = IndexMeta {
            source_title: "Docs".to_string(),
            knowledge_type: Some("technical".to_string()),
            tags: vec!["rust".to_string()],
            contextual_embeddings: false,
        };
        let chunks = vec![
            pending("https://x/a", "# Intro\n\nalpha beta"),
            pending("https://x/b", "gamma delta epsilon"),
        ];

        let outcome = indexer
            .index_chunks("https://x", &chunks, &meta, &NoProgress)
            .await
            .unwrap();
        assert_eq!(outcome, IndexOutcome { stored: 2, skipped: 0 });

        let hashes = store.select_hashes_by_source("https://x").await.unwrap();
        assert_eq!(hashes.len(), 2);

        let rows = store
            .similarity_search(
                crate::store::Table::Chunks,
                &[1.0, 0.0],
                &crate::store::SearchFilter::default(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.knowledge_type.as_deref() == Some("technical")));
        assert!(rows.iter().all(|r| r.tags == vec!["rust".to_string()]));
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let (_, provider, indexer) = setup();
        let chunks = vec![pending("u", "one"), pending("u", "two")];

        let first = indexer
            .index_chunks("s", &chunks, &IndexMeta::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(first, IndexOutcome { stored: 2, skipped: 0 });

        let second = indexer
            .index_chunks("s", &chunks, &IndexMeta::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(second, IndexOutcome { stored: 0, skipped: 2 });
        // The fully-skipped second run makes no provider call.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dedups_within_batch() {
        let (_, _, indexer) = setup();
        let chunks = vec![
            pending("u", "same text"),
            pending("u", "same text"),
            pending("u", "different"),
        ];
        let outcome = indexer
            .index_chunks("s", &chunks, &IndexMeta::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(outcome, IndexOutcome { stored: 2, skipped: 1 });
    }

    #[tokio::test]
    async fn test_single_batched_embed_call() {
        let (_, provider, indexer) = setup();
        let chunks: Vec<PendingChunk> =
            (0..7).map(|i| pending("u", &format!("chunk {i}"))).collect();
        indexer
            .index_chunks("s", &chunks, &IndexMeta::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_input_short_circuits() {
        let (_, provider, indexer) = setup();
        let outcome = indexer
            .index_chunks("s", &[], &IndexMeta::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(outcome, IndexOutcome::default());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_fails_invocation() {
        let store = Arc::new(InMemoryStore::default());
        let provider = Arc::new(RecordingProvider::failing());
        let indexer = Indexer::new(store.clone(), fast_client(provider));

        let err = indexer
            .index_chunks("s", &[pending("u", "text")], &IndexMeta::default(), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provider down"));
        // Nothing stored when the batch embed fails.
        assert!(store.select_hashes_by_source("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contextual_embeddings_prefix_embedded_text_only() {
        let (store, provider, indexer) = setup();
        let meta = IndexMeta {
            source_title: "Tokio Guide".to_string(),
            contextual_embeddings: true,
            ..IndexMeta::default()
        };
        let content = "# Runtime\n\nspawning tasks";
        indexer
            .index_chunks("s", &[pending("u", content)], &meta, &NoProgress)
            .await
            .unwrap();

        let embedded = provider.texts.lock().unwrap().clone();
        assert_eq!(embedded.len(), 1);
        assert!(embedded[0].starts_with("Tokio Guide > Runtime"));

        let rows = store
            .keyword_search(
                crate::store::Table::Chunks,
                "spawning",
                &crate::store::SearchFilter::default(),
                10,
            )
            .await
            .unwrap();
        // Stored content carries no context prefix.
        assert_eq!(rows[0].content, content);
    }

    #[tokio::test]
    async fn test_store_code_examples_batches_and_counts() {
        let (store, provider, indexer) = setup();
        let examples = vec![
            PendingCodeExample {
                url: "https://x/a".to_string(),
                block: CodeBlock {
                    language: Some("rust".to_string()),
                    code: "fn main() {}".to_string(),
                    context: Some("Entry point.".to_string()),
                },
            },
            PendingCodeExample {
                url: "https://x/b".to_string(),
                block: CodeBlock {
                    language: None,
                    code: "echo hi".to_string(),
                    context: None,
                },
            },
        ];

        let stored = indexer
            .store_code_examples("s", &examples, &IndexMeta::default())
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let rows = store
            .keyword_search(
                crate::store::Table::CodeExamples,
                "entry point",
                &crate::store::SearchFilter::default(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "fn main() {}");
    }

    #[tokio::test]
    async fn test_store_code_examples_empty_skips_io() {
        let (_, provider, indexer) = setup();
        let stored = indexer
            .store_code_examples("s", &[], &IndexMeta::default())
            .await
            .unwrap();
        assert_eq!(stored, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
