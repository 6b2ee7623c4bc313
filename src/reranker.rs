//! Cross-encoder reranking of search results.
//!
//! A [`Reranker`] scores `(query, document)` pairs so the search engine
//! can reorder candidate results by semantic relevance. Reranking is a
//! best-effort refinement: the engine absorbs every reranker failure
//! and falls back to the original order, so implementations report
//! errors freely instead of degrading silently.
//!
//! [`HttpReranker`] talks to an HTTP reranking service (a TEI server or
//! a Cohere-compatible API): POST `{model, query, documents}` to
//! `{base_url}/rerank`, read scores from `results[].relevance_score`
//! or a bare `[{index, score}]` array.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::config::RerankerConfig;

/// Scores documents against a query, higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// One score per document, in input order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// Reranker backed by an HTTP scoring endpoint.
pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let base_url = match &config.base_url {
            Some(base_url) => base_url.trim_end_matches('/').to_string(),
            None => bail!("reranker.base_url is required for the http provider"),
        };

        let api_key = config.api_key_env.as_deref().and_then(|var| {
            match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => {
                    tracing::warn!(var, "reranker API key env var not set; sending no auth");
                    None
                }
            }
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build reranker HTTP client")?;

        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
        });

        let mut request = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let resp = request.send().await.context("rerank request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("reranker returned {status}: {body_text}");
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .context("invalid reranker response body")?;
        parse_rerank_response(&json, documents.len())
    }
}

/// Extracts per-document scores from a rerank response.
///
/// Accepts both `{"results": [{"index": i, "relevance_score": s}]}` and
/// the bare-array `[{"index": i, "score": s}]` shape. Every document
/// must be scored exactly once.
fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f32>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .or_else(|| json.as_array())
        .context("reranker response missing results array")?;

    if results.len() != expected {
        bail!(
            "reranker scored {} of {} documents",
            results.len(),
            expected
        );
    }

    let mut scores = vec![None; expected];
    for item in results {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .context("rerank result missing index")? as usize;
        let score = item
            .get("relevance_score")
            .or_else(|| item.get("score"))
            .and_then(|s| s.as_f64())
            .context("rerank result missing score")?;
        if index >= expected {
            bail!("rerank result index {index} out of range");
        }
        if scores[index].replace(score as f32).is_some() {
            bail!("rerank result index {index} scored twice");
        }
    }

    Ok(scores.into_iter().flatten().collect())
}

/// Builds the configured reranker, `None` when reranking is disabled.
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    let reranker = HttpReranker::new(config)?;
    Ok(Some(Arc::new(reranker)))
}
