//! Query-side retrieval: vector search, hybrid merge, reranking.
//!
//! The [`SearchEngine`] wraps a store, an embedding client, and an
//! optional reranker behind one surface. Plain queries embed the text
//! and rank by cosine similarity; hybrid queries run the keyword index
//! as well and merge the two ranked lists, putting results both sides
//! agree on first. Reranking is best effort: a reranker failure is
//! logged and the pre-rerank order returned.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::FeatureFlags;
use crate::embedding::EmbeddingClient;
use crate::models::{ResultMetadata, SearchResult};
use crate::reranker::Reranker;
use crate::store::{MatchRow, SearchFilter, Table, VectorStore};

/// Knobs for one search call. Weights only apply in hybrid mode.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub filter: SearchFilter,
    pub match_count: usize,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    /// Search code examples instead of chunks.
    pub code: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            filter: SearchFilter::default(),
            match_count: 10,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            code: false,
        }
    }
}

pub struct SearchEngine {
    store: Arc<dyn VectorStore>,
    embedder: EmbeddingClient,
    reranker: Option<Arc<dyn Reranker>>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: EmbeddingClient,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
        }
    }

    /// Feature-flag-gated entry point used by the CLI.
    ///
    /// Flags are read on every call, so a flag flip applies to the next
    /// query without a restart. Searching code examples requires the
    /// agentic RAG flag.
    pub async fn search(
        &self,
        text: &str,
        opts: &SearchOptions,
        flags: &FeatureFlags,
    ) -> Result<Vec<SearchResult>> {
        if opts.code && !flags.use_agentic_rag {
            bail!("code example search requires the use_agentic_rag feature flag");
        }
        let table = if opts.code {
            Table::CodeExamples
        } else {
            Table::Chunks
        };

        let results = if flags.use_hybrid_search {
            self.hybrid_on(table, text, opts).await?
        } else {
            self.query_on(table, text, &opts.filter, opts.match_count)
                .await?
        };

        if flags.use_reranking {
            Ok(self.rerank(text, results).await)
        } else {
            Ok(results)
        }
    }

    /// Vector-only search over chunks.
    pub async fn query(
        &self,
        text: &str,
        filter: &SearchFilter,
        match_count: usize,
    ) -> Result<Vec<SearchResult>> {
        self.query_on(Table::Chunks, text, filter, match_count).await
    }

    /// Hybrid vector + keyword search over chunks.
    pub async fn hybrid_query(
        &self,
        text: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        self.hybrid_on(Table::Chunks, text, opts).await
    }

    /// Vector-only search over stored code examples.
    pub async fn search_code_examples(
        &self,
        text: &str,
        filter: &SearchFilter,
        match_count: usize,
    ) -> Result<Vec<SearchResult>> {
        self.query_on(Table::CodeExamples, text, filter, match_count)
            .await
    }

    async fn query_on(
        &self,
        table: Table,
        text: &str,
        filter: &SearchFilter,
        match_count: usize,
    ) -> Result<Vec<SearchResult>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed_query(text).await?;
        let rows = self
            .store
            .similarity_search(table, &embedding, filter, match_count)
            .await?;
        Ok(rows.into_iter().map(into_result).collect())
    }

    async fn hybrid_on(
        &self,
        table: Table,
        text: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed_query(text).await?;
        let vector_rows = self
            .store
            .similarity_search(table, &embedding, &opts.filter, opts.match_count)
            .await?;
        let keyword_rows = self
            .store
            .keyword_search(table, text, &opts.filter, opts.match_count)
            .await?;

        Ok(merge_hybrid(
            vector_rows,
            keyword_rows,
            opts.vector_weight,
            opts.keyword_weight,
            opts.match_count,
        ))
    }

    /// Reorders results by cross-encoder score, best first.
    ///
    /// Any reranker failure (or a score count mismatch) is absorbed:
    /// the incoming order comes back untouched. The sort is stable, so
    /// equal rerank scores preserve retrieval order.
    pub async fn rerank(&self, text: &str, results: Vec<SearchResult>) -> Vec<SearchResult> {
        let Some(reranker) = &self.reranker else {
            return results;
        };
        if results.is_empty() {
            return results;
        }

        let documents: Vec<String> = results.iter().map(|r| r.content.clone()).collect();
        let scores = match reranker.score(text, &documents).await {
            Ok(scores) if scores.len() == results.len() => scores,
            Ok(scores) => {
                tracing::warn!(
                    expected = results.len(),
                    got = scores.len(),
                    "reranker returned wrong score count; keeping original order"
                );
                return results;
            }
            Err(error) => {
                tracing::warn!(%error, "reranking failed; keeping original order");
                return results;
            }
        };

        let mut reranked: Vec<SearchResult> = results
            .into_iter()
            .zip(scores)
            .map(|(mut result, score)| {
                result.rerank_score = Some(score);
                result
            })
            .collect();
        reranked.sort_by(|a, b| {
            b.effective_score()
                .partial_cmp(&a.effective_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        reranked
    }
}

fn into_result(row: MatchRow) -> SearchResult {
    SearchResult {
        id: row.id,
        content: row.content,
        metadata: ResultMetadata {
            source_id: row.source_id,
            url: row.url,
            knowledge_type: row.knowledge_type,
            tags: row.tags,
        },
        similarity_score: row.raw_score,
        rerank_score: None,
    }
}

/// Merges a vector-ranked and a keyword-ranked list into one.
///
/// Scores are min-max normalized per list (a list of identical scores
/// normalizes to 1.0), then combined as a weighted sum. Results present
/// in both lists rank ahead of single-list results regardless of
/// weight, and ties break on id for a deterministic order.
fn merge_hybrid(
    vector_rows: Vec<MatchRow>,
    keyword_rows: Vec<MatchRow>,
    vector_weight: f32,
    keyword_weight: f32,
    match_count: usize,
) -> Vec<SearchResult> {
    let vector_norms = normalize_scores(&vector_rows);
    let keyword_norms = normalize_scores(&keyword_rows);

    let keyword_by_id: HashMap<String, f32> = keyword_rows
        .iter()
        .zip(&keyword_norms)
        .map(|(row, norm)| (row.id.clone(), *norm))
        .collect();

    struct Merged {
        result: SearchResult,
        in_both: bool,
    }

    let mut merged: Vec<Merged> = Vec::new();
    let mut seen: HashMap<String, ()> = HashMap::new();

    for (row, vector_norm) in vector_rows.into_iter().zip(vector_norms) {
        let keyword_norm = keyword_by_id.get(&row.id).copied();
        let score = vector_weight * vector_norm + keyword_weight * keyword_norm.unwrap_or(0.0);
        seen.insert(row.id.clone(), ());
        let mut result = into_result(row);
        result.similarity_score = score;
        merged.push(Merged {
            result,
            in_both: keyword_norm.is_some(),
        });
    }

    for (row, keyword_norm) in keyword_rows.into_iter().zip(keyword_norms) {
        if seen.contains_key(&row.id) {
            continue;
        }
        let mut result = into_result(row);
        result.similarity_score = keyword_weight * keyword_norm;
        merged.push(Merged {
            result,
            in_both: false,
        });
    }

    merged.sort_by(|a, b| {
        b.in_both
            .cmp(&a.in_both)
            .then_with(|| {
                b.result
                    .similarity_score
                    .partial_cmp(&a.result.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.result.id.cmp(&b.result.id))
    });
    merged.truncate(match_count);
    merged.into_iter().map(|m| m.result).collect()
}

/// Min-max normalization of raw scores to [0, 1]. A list whose scores
/// are all equal normalizes to 1.0 so it still contributes its weight.
fn normalize_scores(rows: &[MatchRow]) -> Vec<f32> {
    if rows.is_empty() {
        return Vec::new();
    }
    let min = rows.iter().map(|r| r.raw_score).fold(f32::INFINITY, f32::min);
    let max = rows
        .iter()
        .map(|r| r.raw_score)
        .fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    rows.iter()
        .map(|row| {
            if range <= f32::EPSILON {
                1.0
            } else {
                (row.raw_score - min) / range
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbedError, EmbeddingProvider, RetryPolicy};
    use crate::models::Chunk;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    fn row(id: &str, score: f32) -> MatchRow {
        MatchRow {
            id: id.to_string(),
            source_id: "src".to_string(),
            url: format!("https://x/{id}"),
            content: format!("content {id}"),
            knowledge_type: None,
            tags: Vec::new(),
            raw_score: score,
        }
    }

    #[test]
    fn test_normalize_scores_min_max() {
        let rows = vec![row("a", 2.0), row("b", 6.0), row("c", 4.0)];
        assert_eq!(normalize_scores(&rows), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_normalize_scores_all_equal_is_one() {
        let rows = vec![row("a", 3.0), row("b", 3.0)];
        assert_eq!(normalize_scores(&rows), vec![1.0, 1.0]);
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_merge_overlap_ranks_first() {
        // "b" is weak in both lists but present in both; it must still
        // beat the strong single-list results.
        let vector = vec![row("a", 0.9), row("b", 0.1)];
        let keyword = vec![row("c", 5.0), row("b", 1.0)];

        let merged = merge_hybrid(vector, keyword, 0.7, 0.3, 10);
        assert_eq!(merged[0].id, "b");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_merge_weighted_order_within_groups() {
        let vector = vec![row("a", 1.0), row("b", 0.5), row("c", 0.0)];
        let keyword = vec![row("d", 3.0), row("e", 1.0)];

        let merged = merge_hybrid(vector, keyword, 0.7, 0.3, 10);
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        // No overlap: pure weighted order. a=0.7, b=0.35, d=0.3, e=0, c=0.
        assert_eq!(ids, vec!["a", "b", "d", "c", "e"]);
    }

    #[test]
    fn test_merge_dedups_and_truncates() {
        let vector = vec![row("a", 0.9), row("b", 0.8), row("c", 0.7)];
        let keyword = vec![row("a", 2.0), row("d", 1.0)];

        let merged = merge_hybrid(vector, keyword, 0.7, 0.3, 2);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "a");
        let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.iter().filter(|id| **id == "a").count(), 1);
    }

    /// Embeds along two axes: occurrences of "alpha" and "beta".
    struct KeywordProvider;

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        fn model_name(&self) -> &str {
            "keyword"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let a = t.matches("alpha").count() as f32;
                    let b = t.matches("beta").count() as f32;
                    vec![a, b]
                })
                .collect())
        }
    }

    fn client() -> EmbeddingClient {
        EmbeddingClient::new(
            Arc::new(KeywordProvider),
            RetryPolicy::new(1, Duration::from_millis(0), 1),
        )
    }

    fn chunk(id: &str, content: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            source_id: "src".to_string(),
            url: format!("https://x/{id}"),
            content: content.to_string(),
            embedding,
            content_hash: format!("hash-{id}"),
            headers: Vec::new(),
            knowledge_type: None,
            tags: Vec::new(),
            char_count: content.len() as i64,
            word_count: content.split_whitespace().count() as i64,
            created_at: 0,
        }
    }

    async fn seeded_engine(reranker: Option<Arc<dyn Reranker>>) -> SearchEngine {
        let store = Arc::new(InMemoryStore::default());
        store
            .insert_chunks(&[
                chunk("a", "alpha alpha notes", vec![2.0, 0.0]),
                chunk("b", "beta handbook", vec![0.0, 1.0]),
                chunk("c", "alpha beta mixed", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();
        SearchEngine::new(store, client(), reranker)
    }

    #[tokio::test]
    async fn test_query_empty_text_short_circuits() {
        let engine = seeded_engine(None).await;
        assert!(engine
            .query("   ", &SearchFilter::default(), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let engine = seeded_engine(None).await;
        let results = engine
            .query("alpha", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(results[0].id, "a");
        assert!(results[0].similarity_score >= results[1].similarity_score);
        assert_eq!(results[0].metadata.url, "https://x/a");
    }

    #[tokio::test]
    async fn test_hybrid_query_prefers_overlap() {
        let engine = seeded_engine(None).await;
        let results = engine
            .hybrid_query("alpha", &SearchOptions::default())
            .await
            .unwrap();
        // "a" and "c" match both the vector and the keyword side.
        assert!(results.iter().take(2).all(|r| r.id == "a" || r.id == "c"));
    }

    struct FixedReranker(Vec<f32>);

    #[async_trait]
    impl Reranker for FixedReranker {
        async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
            bail!("rerank service unavailable")
        }
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_attaches_scores() {
        let engine = seeded_engine(None).await;
        let results = engine
            .query("alpha", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(results.len() >= 2);

        // Push the last retrieval result to the top.
        let mut scores = vec![0.1; results.len()];
        if let Some(last) = scores.last_mut() {
            *last = 0.9;
        }
        let engine_with = seeded_engine(Some(Arc::new(FixedReranker(scores)))).await;

        let last_id = results.last().unwrap().id.clone();
        let reranked = engine_with.rerank("alpha", results).await;
        assert_eq!(reranked[0].id, last_id);
        assert_eq!(reranked[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_rerank_failure_keeps_original_order() {
        let engine = seeded_engine(Some(Arc::new(BrokenReranker))).await;
        let results = engine
            .query("alpha", &SearchFilter::default(), 10)
            .await
            .unwrap();
        let original: Vec<String> = results.iter().map(|r| r.id.clone()).collect();

        let reranked = engine.rerank("alpha", results).await;
        let after: Vec<String> = reranked.iter().map(|r| r.id.clone()).collect();
        assert_eq!(original, after);
        assert!(reranked.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_rerank_score_count_mismatch_keeps_order() {
        let engine = seeded_engine(Some(Arc::new(FixedReranker(vec![0.5])))).await;
        let results = engine
            .query("alpha", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert!(results.len() > 1);
        let original: Vec<String> = results.iter().map(|r| r.id.clone()).collect();
        let reranked = engine.rerank("alpha", results).await;
        let after: Vec<String> = reranked.iter().map(|r| r.id.clone()).collect();
        assert_eq!(original, after);
    }

    #[tokio::test]
    async fn test_search_gates_code_on_flag() {
        let engine = seeded_engine(None).await;
        let opts = SearchOptions {
            code: true,
            ..SearchOptions::default()
        };
        let flags = FeatureFlags::default();
        assert!(engine.search("alpha", &opts, &flags).await.is_err());

        let flags = FeatureFlags {
            use_agentic_rag: true,
            ..FeatureFlags::default()
        };
        // No code examples stored: empty, not an error.
        assert!(engine.search("alpha", &opts, &flags).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_respects_hybrid_flag_per_call() {
        let engine = seeded_engine(None).await;
        let opts = SearchOptions::default();

        let plain = engine
            .search("alpha", &opts, &FeatureFlags::default())
            .await
            .unwrap();
        assert!(!plain.is_empty());

        let hybrid_flags = FeatureFlags {
            use_hybrid_search: true,
            ..FeatureFlags::default()
        };
        let hybrid = engine.search("alpha", &opts, &hybrid_flags).await.unwrap();
        assert!(!hybrid.is_empty());
    }
}
