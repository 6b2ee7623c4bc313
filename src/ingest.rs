//! Ingestion pipeline orchestration.
//!
//! Ties the stages together for one source: crawl (or file extraction)
//! → chunking → embedding → storage, with registry status transitions
//! around the whole run. Progress is reported on a single 0..=100 scale
//! across phases. Any failure after the source enters `in_progress`
//! marks it `failed` before the error propagates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::chunker::{chunk_text, extract_code_blocks};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::extract::{self, UploadKind};
use crate::fetcher::{is_sitemap, is_txt, Fetcher};
use crate::indexer::{IndexMeta, Indexer, PendingCodeExample};
use crate::models::{FetchResult, OriginType, PendingChunk};
use crate::progress::{
    IngestPhase, ProgressEvent, ProgressReporter, CHUNK_CEILING, CRAWL_CEILING,
};
use crate::registry::SourceRegistry;
use crate::store::VectorStore;

/// One crawl run. The URL doubles as the source id.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub url: String,
    pub max_depth: usize,
    pub max_concurrent: usize,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
}

/// One local-file upload run. The canonical path doubles as the
/// source id.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: PathBuf,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
}

/// What one ingestion run did, for the CLI summary.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub source_id: String,
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub chunks_stored: usize,
    pub chunks_skipped: usize,
    pub code_examples_stored: usize,
    pub word_count: i64,
}

/// Crawls a URL and indexes everything it yields.
///
/// The fetch strategy depends on the URL: sitemaps are expanded and
/// their pages fetched in parallel, `.txt` documents are taken verbatim
/// as a single page, and everything else is crawled breadth-first up to
/// `max_depth` (depth 1 fetches only the seed). An empty sitemap
/// completes with zero pages rather than failing.
pub async fn run_crawl(
    config: &Config,
    store: Arc<dyn VectorStore>,
    registry: &SourceRegistry,
    request: CrawlRequest,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let _guard = registry.ingest_guard(&request.url).await;

    registry
        .register(
            &request.url,
            &request.url,
            OriginType::Url,
            request.knowledge_type.clone(),
            request.tags.clone(),
        )
        .await?;
    registry.mark_in_progress(&request.url).await?;

    match crawl_source(config, store, &request, progress, cancel).await {
        Ok(done) => {
            registry
                .mark_completed(
                    &request.url,
                    done.report.word_count,
                    &done.summary,
                    done.title.as_deref(),
                )
                .await?;
            Ok(done.report)
        }
        Err(error) => {
            if let Err(mark_error) = registry.mark_failed(&request.url).await {
                tracing::warn!(source = %request.url, %mark_error, "failed to mark source failed");
            }
            Err(error)
        }
    }
}

/// Extracts a local file and indexes it as a single-page source.
pub async fn run_upload(
    config: &Config,
    store: Arc<dyn VectorStore>,
    registry: &SourceRegistry,
    request: UploadRequest,
    progress: &dyn ProgressReporter,
) -> Result<IngestReport> {
    let canonical = request
        .path
        .canonicalize()
        .unwrap_or_else(|_| request.path.clone());
    let source_id = canonical.to_string_lossy().to_string();
    let title = canonical
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| source_id.clone());

    let kind = UploadKind::from_path(&canonical)
        .with_context(|| format!("unsupported file type: {}", canonical.display()))?;

    let _guard = registry.ingest_guard(&source_id).await;

    registry
        .register(
            &source_id,
            &title,
            OriginType::File,
            request.knowledge_type.clone(),
            request.tags.clone(),
        )
        .await?;
    registry.mark_in_progress(&source_id).await?;

    let outcome = async {
        progress.report(ProgressEvent::new(
            IngestPhase::Extracting,
            10,
            format!("extracting {}", canonical.display()),
        ));
        let bytes = tokio::fs::read(&canonical)
            .await
            .with_context(|| format!("failed to read {}", canonical.display()))?;
        let text = extract::extract_text(&bytes, kind)
            .with_context(|| format!("failed to extract {}", canonical.display()))?;

        let page = FetchResult {
            url: source_id.clone(),
            success: true,
            content: text,
            title: Some(title.clone()),
            links: Default::default(),
            error: None,
        };
        index_pages(config, store, &source_id, &title, vec![page], 0, progress).await
    }
    .await;

    match outcome {
        Ok(done) => {
            registry
                .mark_completed(
                    &source_id,
                    done.report.word_count,
                    &done.summary,
                    done.title.as_deref(),
                )
                .await?;
            Ok(done.report)
        }
        Err(error) => {
            if let Err(mark_error) = registry.mark_failed(&source_id).await {
                tracing::warn!(source = %source_id, %mark_error, "failed to mark source failed");
            }
            Err(error)
        }
    }
}

struct IngestDone {
    report: IngestReport,
    summary: String,
    title: Option<String>,
}

async fn crawl_source(
    config: &Config,
    store: Arc<dyn VectorStore>,
    request: &CrawlRequest,
    progress: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<IngestDone> {
    let fetcher = Fetcher::new(&config.crawl)?;

    let results: Vec<FetchResult> = if is_sitemap(&request.url) {
        progress.report(ProgressEvent::new(
            IngestPhase::Crawling,
            0,
            format!("expanding sitemap {}", request.url),
        ));
        let pages = fetcher.expand_sitemap(&request.url).await;
        tracing::info!(sitemap = %request.url, pages = pages.len(), "sitemap expanded");
        fetcher
            .crawl_batch(&pages, request.max_concurrent, progress, cancel)
            .await
    } else if is_txt(&request.url) {
        progress.report(ProgressEvent::new(
            IngestPhase::Crawling,
            0,
            format!("fetching {}", request.url),
        ));
        vec![fetcher.fetch_page(&request.url).await]
    } else if request.max_depth <= 1 {
        progress.report(ProgressEvent::new(
            IngestPhase::Crawling,
            0,
            format!("fetching {}", request.url),
        ));
        vec![fetcher.fetch_page(&request.url).await]
    } else {
        fetcher
            .crawl_recursive(
                std::slice::from_ref(&request.url),
                request.max_depth,
                request.max_concurrent,
                progress,
                cancel,
            )
            .await
    };

    if cancel.is_cancelled() {
        bail!("crawl cancelled");
    }

    let pages_failed = results.iter().filter(|r| !r.success).count();
    for failure in results.iter().filter(|r| !r.success) {
        tracing::warn!(
            url = %failure.url,
            error = failure.error.as_deref().unwrap_or("unknown"),
            "page fetch failed"
        );
    }

    let attempted = results.len();
    let pages: Vec<FetchResult> = results.into_iter().filter(|r| r.success).collect();
    if pages.is_empty() && pages_failed > 0 {
        bail!("all {pages_failed} pages failed to fetch");
    }
    progress.report(ProgressEvent::new(
        IngestPhase::Crawling,
        CRAWL_CEILING,
        format!("fetched {} of {} pages", pages.len(), attempted),
    ));

    index_pages(
        config,
        store,
        &request.url,
        &request.url,
        pages,
        pages_failed,
        progress,
    )
    .await
}

/// Chunks fetched pages and hands them to the indexer. Shared by crawl
/// and upload once page content is in hand.
async fn index_pages(
    config: &Config,
    store: Arc<dyn VectorStore>,
    source_id: &str,
    fallback_title: &str,
    pages: Vec<FetchResult>,
    pages_failed: usize,
    progress: &dyn ProgressReporter,
) -> Result<IngestDone> {
    let title = pages.iter().find_map(|page| page.title.clone());

    let mut pending: Vec<PendingChunk> = Vec::new();
    let mut examples: Vec<PendingCodeExample> = Vec::new();
    let total = pages.len().max(1);
    for (i, page) in pages.iter().enumerate() {
        for content in chunk_text(
            &page.content,
            config.chunking.chunk_size,
            config.chunking.overlap,
        ) {
            pending.push(PendingChunk {
                url: page.url.clone(),
                content,
            });
        }
        if config.flags.use_agentic_rag {
            for block in
                extract_code_blocks(&page.content, config.chunking.min_code_block_chars)
            {
                examples.push(PendingCodeExample {
                    url: page.url.clone(),
                    block,
                });
            }
        }
        let span = (CHUNK_CEILING - CRAWL_CEILING) as usize;
        let pct = CRAWL_CEILING + (span * (i + 1) / total) as u8;
        progress.report(ProgressEvent::new(
            IngestPhase::Chunking,
            pct,
            format!("chunked {} / {} pages", i + 1, total),
        ));
    }

    let word_count: i64 = pending
        .iter()
        .map(|chunk| chunk.content.split_whitespace().count() as i64)
        .sum();
    let summary = summarize(&pending);

    // Classification lives on the source row; chunk rows carry a copy.
    let source = store.get_source(source_id).await?;
    let meta = IndexMeta {
        source_title: title.clone().unwrap_or_else(|| fallback_title.to_string()),
        knowledge_type: source.as_ref().and_then(|s| s.knowledge_type.clone()),
        tags: source.map(|s| s.tags).unwrap_or_default(),
        contextual_embeddings: config.flags.use_contextual_embeddings,
    };

    let embedder = EmbeddingClient::from_config(&config.embedding)?;
    let indexer = Indexer::new(store, embedder);
    let outcome = indexer
        .index_chunks(source_id, &pending, &meta, progress)
        .await?;
    let code_examples_stored = indexer
        .store_code_examples(source_id, &examples, &meta)
        .await?;

    Ok(IngestDone {
        report: IngestReport {
            source_id: source_id.to_string(),
            pages_fetched: pages.len(),
            pages_failed,
            chunks_stored: outcome.stored,
            chunks_skipped: outcome.skipped,
            code_examples_stored,
            word_count,
        },
        summary,
        title,
    })
}

/// First prose line of the first chunk, capped at 240 chars. Good
/// enough for the sources listing.
fn summarize(chunks: &[PendingChunk]) -> String {
    let Some(first) = chunks.first() else {
        return String::new();
    };
    let line = first
        .content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("```"))
        .unwrap_or("");
    truncate_chars(line, 240)
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(content: &str) -> PendingChunk {
        PendingChunk {
            url: "u".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_summarize_skips_headings_and_fences() {
        let chunks = vec![pending("# Title\n\n```rust\ncode\n```\n\nActual prose here.")];
        assert_eq!(summarize(&chunks), "Actual prose here.");
        assert_eq!(summarize(&[]), "");
    }

    #[test]
    fn test_summarize_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let chunks = vec![pending(&long)];
        assert_eq!(summarize(&chunks).chars().count(), 240);
    }
}
