//! Core data models used throughout Quarry.
//!
//! These types represent the sources, chunks, code examples, and search
//! results that flow through the ingestion and retrieval pipeline.

use serde::Serialize;

/// Where a source's content originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    Url,
    File,
}

impl OriginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginType::Url => "url",
            OriginType::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<OriginType> {
        match s {
            "url" => Some(OriginType::Url),
            "file" => Some(OriginType::File),
            _ => None,
        }
    }
}

/// Lifecycle state of a source's most recent ingestion run.
///
/// Legal transitions: `Pending -> InProgress -> {Completed, Failed}`.
/// A re-crawl resets the record to `Pending` through
/// [`crate::registry::SourceRegistry::register`], never by walking the
/// machine backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Pending => "pending",
            CrawlStatus::InProgress => "in_progress",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<CrawlStatus> {
        match s {
            "pending" => Some(CrawlStatus::Pending),
            "in_progress" => Some(CrawlStatus::InProgress),
            "completed" => Some(CrawlStatus::Completed),
            "failed" => Some(CrawlStatus::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: CrawlStatus) -> bool {
        matches!(
            (self, next),
            (CrawlStatus::Pending, CrawlStatus::InProgress)
                | (CrawlStatus::InProgress, CrawlStatus::Completed)
                | (CrawlStatus::InProgress, CrawlStatus::Failed)
        )
    }
}

/// One crawl origin or uploaded file.
#[derive(Debug, Clone)]
pub struct Source {
    /// Stable key: canonicalized URL or file identifier.
    pub id: String,
    pub title: String,
    /// Auto-extracted from the first indexed content.
    pub summary: String,
    pub origin_type: OriginType,
    pub crawl_status: CrawlStatus,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
    pub word_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One indexed content fragment, immutable once created.
///
/// Metadata (`knowledge_type`, `tags`) is denormalized from the owning
/// source so search results need no join.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub source_id: String,
    /// Page the chunk came from; may equal the source id.
    pub url: String,
    pub content: String,
    pub embedding: Vec<f32>,
    /// SHA-256 hex of the normalized content; dedup key within a source.
    pub content_hash: String,
    /// Markdown headings present in the chunk, in order.
    pub headers: Vec<String>,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
    pub char_count: i64,
    pub word_count: i64,
    pub created_at: i64,
}

/// An extracted code fragment, embedded and ranked apart from prose.
#[derive(Debug, Clone)]
pub struct CodeExample {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub code_block: String,
    /// Short description: fence language plus surrounding prose.
    pub summary: String,
    pub embedding: Vec<f32>,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
    pub created_at: i64,
}

/// Metadata carried on every search result, denormalized from the chunk
/// row so no source join is needed.
#[derive(Debug, Clone, Serialize)]
pub struct ResultMetadata {
    pub source_id: String,
    pub url: String,
    pub knowledge_type: Option<String>,
    pub tags: Vec<String>,
}

/// A ranked hit returned from the search engine. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    pub metadata: ResultMetadata,
    /// Score from the vector or keyword match that produced this hit.
    pub similarity_score: f32,
    /// Present only when a reranking pass succeeded.
    pub rerank_score: Option<f32>,
}

impl SearchResult {
    /// The score governing final ordering for the mode that produced
    /// this result set.
    pub fn effective_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.similarity_score)
    }
}

/// Links discovered on a fetched page, resolved to absolute URLs.
#[derive(Debug, Clone, Default)]
pub struct PageLinks {
    /// Same-host links, eligible for recursive crawling.
    pub internal: Vec<String>,
    pub external: Vec<String>,
}

/// Outcome of fetching a single URL. Failures are carried in-band so a
/// batch crawl never aborts on one bad page.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub success: bool,
    pub content: String,
    pub title: Option<String>,
    pub links: PageLinks,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn failure(url: &str, error: String) -> FetchResult {
        FetchResult {
            url: url.to_string(),
            success: false,
            content: String::new(),
            title: None,
            links: PageLinks::default(),
            error: Some(error),
        }
    }
}

/// Chunker output waiting to be hashed, embedded, and stored.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub url: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_status_round_trip() {
        for status in [
            CrawlStatus::Pending,
            CrawlStatus::InProgress,
            CrawlStatus::Completed,
            CrawlStatus::Failed,
        ] {
            assert_eq!(CrawlStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CrawlStatus::parse("bogus"), None);
    }

    #[test]
    fn test_legal_transitions() {
        assert!(CrawlStatus::Pending.can_transition_to(CrawlStatus::InProgress));
        assert!(CrawlStatus::InProgress.can_transition_to(CrawlStatus::Completed));
        assert!(CrawlStatus::InProgress.can_transition_to(CrawlStatus::Failed));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!CrawlStatus::Pending.can_transition_to(CrawlStatus::Completed));
        assert!(!CrawlStatus::Completed.can_transition_to(CrawlStatus::InProgress));
        assert!(!CrawlStatus::Failed.can_transition_to(CrawlStatus::Completed));
        assert!(!CrawlStatus::InProgress.can_transition_to(CrawlStatus::Pending));
    }

    #[test]
    fn test_effective_score_prefers_rerank() {
        let mut result = SearchResult {
            id: "c1".to_string(),
            content: String::new(),
            metadata: ResultMetadata {
                source_id: "s".to_string(),
                url: "u".to_string(),
                knowledge_type: None,
                tags: Vec::new(),
            },
            similarity_score: 0.4,
            rerank_score: None,
        };
        assert_eq!(result.effective_score(), 0.4);
        result.rerank_score = Some(0.9);
        assert_eq!(result.effective_score(), 0.9);
    }
}
