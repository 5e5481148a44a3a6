//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and two concrete backends:
//!
//! - **[`MockProvider`]** — deterministic vectors from a PRNG seeded by a
//!   hash of the text. Used by tests and whenever no real provider is
//!   configured (unless strict mode is set).
//! - **[`OpenAiProvider`]** — calls an OpenAI-style embeddings endpoint with
//!   batching, retry, and exponential backoff.
//!
//! Every vector leaving this module has exactly [`EMBEDDING_DIMS`] finite
//! components; providers that emit a different width are resampled with
//! linear interpolation over indices.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{CoreError, Result};
use crate::models::EMBEDDING_DIMS;

/// Trait for embedding providers. Batching is opaque to callers; output
/// order always matches input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"` or `"mock"`).
    fn model_name(&self) -> &str;

    /// Embed a single text. Fails with `InvalidInput` on empty input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, outputs in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Resample a vector to exactly `dims` components via linear interpolation
/// over indices. Identity when the width already matches.
pub fn resample(vector: &[f32], dims: usize) -> Result<Vec<f32>> {
    if vector.is_empty() {
        return Err(CoreError::MalformedVector("empty vector".to_string()));
    }
    if vector.len() == dims {
        return Ok(vector.to_vec());
    }
    if vector.len() == 1 {
        return Ok(vec![vector[0]; dims]);
    }
    let mut out = Vec::with_capacity(dims);
    let scale = (vector.len() - 1) as f64 / (dims - 1) as f64;
    for i in 0..dims {
        let pos = i as f64 * scale;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let v = if lo == hi {
            vector[lo]
        } else {
            let frac = (pos - lo as f64) as f32;
            vector[lo] + (vector[hi] - vector[lo]) * frac
        };
        out.push(v);
    }
    Ok(out)
}

fn check_nonempty(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(CoreError::InvalidInput(
            "cannot embed empty text".to_string(),
        ));
    }
    Ok(())
}

// ============ Mock provider ============

/// Deterministic embedding provider: seeds a PRNG from a SHA-256 hash of
/// the text, so the same text always yields the same vector.
pub struct MockProvider;

impl MockProvider {
    fn vector_for(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let seed = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut v: Vec<f32> = (0..EMBEDDING_DIMS).map(|_| rng.gen_range(-1.0..1.0)).collect();
        // L2-normalize so cosine similarities are well-behaved
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        check_nonempty(text)?;
        Ok(Self::vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|t| {
                check_nonempty(t)?;
                Ok(Self::vector_for(t))
            })
            .collect()
    }
}

// ============ OpenAI-style provider ============

/// Embedding provider for an OpenAI-compatible `POST /embeddings` endpoint.
/// Requires `OPENAI_API_KEY` in the environment.
///
/// Retry strategy mirrors the rest of the HTTP stack: 429/5xx and network
/// errors retry with exponential backoff (1s, 2s, 4s, ... capped at 2^5);
/// other 4xx fail immediately.
pub struct OpenAiProvider {
    model: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            CoreError::InvalidInput("embedding.model required for openai provider".to_string())
        })?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(CoreError::InvalidInput(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }
        Ok(Self {
            model,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| CoreError::InvalidInput("OPENAI_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<CoreError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| CoreError::MalformedVector(e.to_string()))?;
                        return parse_embeddings_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(CoreError::Storage(format!(
                            "embeddings API error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(CoreError::Storage(format!(
                        "embeddings API error {}: {}",
                        status, text
                    )));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(CoreError::Timeout(e.to_string()));
                    continue;
                }
                Err(e) => {
                    last_err = Some(CoreError::Storage(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CoreError::Storage("embedding failed after retries".to_string())))
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CoreError::MalformedVector("missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let raw = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| CoreError::MalformedVector("missing embedding".to_string()))?;
        let vec: Vec<f32> = raw
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(resample(&vec, EMBEDDING_DIMS)?);
    }
    Ok(embeddings)
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        check_nonempty(text)?;
        let mut result = self.call(&[text.to_string()]).await?;
        result
            .pop()
            .ok_or_else(|| CoreError::MalformedVector("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        for t in texts {
            check_nonempty(t)?;
        }
        self.call(texts).await
    }
}

// ============ Provider selection ============

/// Create the configured provider. Falls back to the mock provider when the
/// openai provider cannot be initialized, unless strict mode forbids it.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "mock" => {
            if config.strict {
                return Err(CoreError::InvalidInput(
                    "strict mode refuses the mock embedding provider".to_string(),
                ));
            }
            Ok(Arc::new(MockProvider))
        }
        "openai" => match OpenAiProvider::new(config) {
            Ok(p) => Ok(Arc::new(p)),
            Err(e) if !config.strict => {
                debug!("openai embedding provider unavailable ({}), using mock", e);
                Ok(Arc::new(MockProvider))
            }
            Err(e) => Err(e),
        },
        other => Err(CoreError::InvalidInput(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Bounded worker pool ============

/// Embed texts in batches through a bounded worker pool. Batches run
/// concurrently up to `workers`; output order matches input order.
pub async fn embed_all(
    provider: Arc<dyn EmbeddingProvider>,
    texts: Vec<String>,
    batch_size: usize,
    workers: usize,
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let batch_size = batch_size.max(1);
    let semaphore = Arc::new(tokio::sync::Semaphore::new(workers.max(1)));
    let mut handles = Vec::new();

    for (batch_idx, batch) in texts.chunks(batch_size).enumerate() {
        let provider = Arc::clone(&provider);
        let semaphore = Arc::clone(&semaphore);
        let batch: Vec<String> = batch.to_vec();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| CoreError::Storage(e.to_string()))?;
            let vectors = provider.embed_batch(&batch).await?;
            Ok::<(usize, Vec<Vec<f32>>), CoreError>((batch_idx, vectors))
        }));
    }

    let mut results: Vec<(usize, Vec<Vec<f32>>)> = Vec::with_capacity(handles.len());
    for handle in handles {
        let (idx, vectors) = handle
            .await
            .map_err(|e| CoreError::Storage(format!("embedding task panicked: {}", e)))??;
        results.push((idx, vectors));
    }
    results.sort_by_key(|(idx, _)| *idx);

    Ok(results.into_iter().flat_map(|(_, v)| v).collect())
}
