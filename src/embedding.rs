//! Embedding client, provider abstraction, and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`ZeroProvider`]** — returns deterministic zero vectors; used when
//!   embeddings are unconfigured or credentials are absent, so the rest
//!   of the pipeline stays exercisable.
//! - **[`OpenAiProvider`]** — calls an OpenAI-compatible embeddings API.
//!
//! Batching and retry live in [`EmbeddingClient`], which wraps a provider
//! together with a [`RetryPolicy`]. Also provides vector utilities for
//! BLOB storage:
//! - [`cosine_similarity`] — compute similarity between two vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! Transient provider failures are retried with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: base delay × multiplier per retry, exponent capped at 2^5
//!
//! The policy is a plain value object so tests can assert the delay
//! schedule without sleeping.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Cap on the backoff exponent (base × multiplier^5 at most).
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Error returned by an embedding provider, classified by whether the
/// caller should retry.
#[derive(Debug)]
pub enum EmbedError {
    /// Transient: rate limit, server error, network failure.
    Retryable(String),
    /// Permanent: bad request, bad credentials, malformed response.
    Permanent(String),
}

impl std::fmt::Display for EmbedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbedError::Retryable(msg) => write!(f, "retryable embedding error: {}", msg),
            EmbedError::Permanent(msg) => write!(f, "embedding error: {}", msg),
        }
    }
}

impl std::error::Error for EmbedError {}

/// Retry schedule for batch embedding calls: total attempt count, base
/// delay, and per-retry multiplier.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use quarry::embedding::RetryPolicy;
///
/// let policy = RetryPolicy::new(4, Duration::from_millis(100), 2);
/// let delays: Vec<_> = policy.delays().collect();
/// assert_eq!(delays, vec![
///     Duration::from_millis(100),
///     Duration::from_millis(200),
///     Duration::from_millis(400),
/// ]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(
            config.max_retries.max(1),
            Duration::from_millis(config.retry_base_delay_ms),
            config.retry_multiplier.max(1),
        )
    }

    /// Delay before the given retry (1-based), exponent capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(exponent))
    }

    /// The full delay schedule: one entry per retry after the first
    /// attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|retry| self.delay_for(retry))
    }
}

/// Trait for embedding providers.
///
/// A provider turns a batch of texts into one fixed-dimension vector per
/// text. Classification of failures into [`EmbedError`] variants is the
/// provider's job; retrying is the [`EmbeddingClient`]'s.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

// ============ Zero Provider ============

/// Deterministic zero-vector provider.
///
/// Selected when `embedding.provider = "none"` or when the configured
/// provider's API key is absent from the environment. Keyword search and
/// the full ingestion path keep working; similarity scores are just
/// uninformative.
pub struct ZeroProvider {
    dims: usize,
}

impl ZeroProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for ZeroProvider {
    fn model_name(&self) -> &str {
        "none"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|_| vec![0.0; self.dims]).collect())
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for an OpenAI-compatible embeddings API.
///
/// Calls `POST {base_url}/embeddings` with the configured model. The
/// base URL is configurable so self-hosted compatible servers (and test
/// mocks) work unchanged.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a provider from configuration and a resolved API key.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Retryable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| EmbedError::Permanent(format!("invalid response body: {}", e)))?;
            return parse_embedding_response(&json);
        }

        let body_text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(EmbedError::Retryable(format!(
                "provider returned {}: {}",
                status, body_text
            )))
        } else {
            Err(EmbedError::Permanent(format!(
                "provider returned {}: {}",
                status, body_text
            )))
        }
    }
}

/// Parse an OpenAI-shaped embeddings response.
///
/// Extracts the `data[].embedding` arrays and returns them in order.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Permanent("response missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Permanent("response item missing embedding".to_string()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Client ============

/// A provider plus a retry policy. All pipeline embedding goes through
/// this type; it owns batching guarantees (one provider round trip per
/// call, all-or-nothing results).
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Build a client from configuration.
    ///
    /// Provider selection:
    ///
    /// | Config value | Provider |
    /// |--------------|----------|
    /// | `"none"` | [`ZeroProvider`] |
    /// | `"openai"` | [`OpenAiProvider`], or [`ZeroProvider`] when the key env var is unset |
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
            "none" => Arc::new(ZeroProvider::new(config.dims)),
            "openai" => match std::env::var(&config.api_key_env) {
                Ok(key) if !key.trim().is_empty() => {
                    Arc::new(OpenAiProvider::new(config, key)?)
                }
                _ => {
                    tracing::warn!(
                        env = %config.api_key_env,
                        "embedding credentials missing, using zero vectors"
                    );
                    Arc::new(ZeroProvider::new(config.dims))
                }
            },
            other => bail!("Unknown embedding provider: {}", other),
        };
        Ok(Self {
            provider,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed a batch of texts in one provider round trip, retrying
    /// transient failures per the policy.
    ///
    /// # Errors
    ///
    /// Fails once retries are exhausted or on the first permanent
    /// provider error. A partial batch is never returned: the provider
    /// must yield exactly one vector of the right dimension per input.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut retry = 0u32;
        loop {
            match self.provider.embed(texts).await {
                Ok(vectors) => {
                    if vectors.len() != texts.len() {
                        bail!(
                            "provider returned {} vectors for {} inputs",
                            vectors.len(),
                            texts.len()
                        );
                    }
                    let dims = self.provider.dims();
                    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                        bail!(
                            "provider returned a {}-dim vector, expected {}",
                            bad.len(),
                            dims
                        );
                    }
                    return Ok(vectors);
                }
                Err(EmbedError::Permanent(msg)) => bail!("embedding failed: {}", msg),
                Err(EmbedError::Retryable(msg)) => {
                    retry += 1;
                    if retry >= self.retry.max_attempts {
                        bail!(
                            "embedding failed after {} attempts: {}",
                            self.retry.max_attempts,
                            msg
                        );
                    }
                    let delay = self.retry.delay_for(retry);
                    tracing::warn!(
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "transient embedding failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text.to_string()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use quarry::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
///
/// Reverses [`vec_to_blob`]: reads 4-byte little-endian `f32` values
/// from the byte slice.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors, vectors of
/// different lengths, or a zero-magnitude side.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
