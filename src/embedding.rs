//! Embedding providers and the resilient batch driver.
//!
//! Providers implement [`Embedder`] from the core crate and make exactly
//! one attempt per call, classifying failures:
//!
//! - HTTP 429 (rate limited), 5xx and transport errors → [`EmbeddingError::Transient`]
//! - other HTTP 4xx and malformed responses → [`EmbeddingError::Rejected`]
//!
//! [`ResilientEmbedder`] wraps a provider with a per-call timeout, bounded
//! retry with exponential backoff and a dimensionality check.
//! [`embed_batch`] drives one ingestion batch and falls back to per-item
//! calls when the provider rejects the batch as a whole.
//!
//! # Provider Selection
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledEmbedder`] |
//! | `"openai"` | [`OpenAiEmbedder`] |
//! | `"ollama"` | [`OllamaEmbedder`] |
//! | `"local"` | `LocalEmbedder` (fastembed, feature `local-embeddings-fastembed`) |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use repo_guide_core::embedding::{validate_batch, Embedder};
use repo_guide_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;

// ============ Disabled ============

/// Fails every call with [`EmbeddingError::Disabled`].
pub struct DisabledEmbedder {
    dims: usize,
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ OpenAI ============

/// `POST https://api.openai.com/v1/embeddings` with `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key,
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let json = read_json(response, "OpenAI").await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| rejected("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| rejected("invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_f32_vec(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// `POST {url}/api/embed` on a local Ollama instance.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EmbeddingError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;
        let json = read_json(response, "Ollama").await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| rejected("invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| rejected("invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

// ============ Local (fastembed) ============

/// In-process embeddings via fastembed. The model is downloaded on first
/// use, then loaded once and reused.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        // Fail on unknown names at startup rather than on first use.
        fastembed_model(&model_name)?;
        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size,
            model: std::sync::Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let slot = std::sync::Arc::clone(&self.model);
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| EmbeddingError::Transient("local model lock poisoned".to_string()))?;
            if guard.is_none() {
                let model = fastembed_model(&name).map_err(|e| rejected(e.to_string()))?;
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(true),
                )
                .map_err(|e| {
                    EmbeddingError::Transient(format!(
                        "failed to initialize local embedding model: {}",
                        e
                    ))
                })?;
                *guard = Some(loaded);
            }
            match guard.as_mut() {
                Some(model) => model
                    .embed(texts, Some(batch_size))
                    .map_err(|e| rejected(format!("local embedding failed: {}", e))),
                None => Err(EmbeddingError::Transient("local model not loaded".to_string())),
            }
        })
        .await
        .map_err(|e| EmbeddingError::Transient(format!("embedding task failed: {}", e)))?
    }
}

fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5",
            other
        ),
    }
}

// ============ Shared HTTP helpers ============

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn rejected(message: impl Into<String>) -> EmbeddingError {
    EmbeddingError::Rejected(message.into())
}

fn transport_error(e: reqwest::Error) -> EmbeddingError {
    EmbeddingError::Transient(e.to_string())
}

/// Map an HTTP status to the matching error class.
fn status_error(provider: &str, status: u16, body: &str) -> EmbeddingError {
    let message = format!("{} API error {}: {}", provider, status, body.trim());
    if status == 429 || (500..600).contains(&status) {
        EmbeddingError::Transient(message)
    } else {
        EmbeddingError::Rejected(message)
    }
}

async fn read_json(
    response: reqwest::Response,
    provider: &str,
) -> Result<serde_json::Value, EmbeddingError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(provider, status.as_u16(), &body));
    }
    response
        .json()
        .await
        .map_err(|e| rejected(format!("invalid {} response: {}", provider, e)))
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Resilience ============

/// Timeout, bounded retry and dimension checks around a provider.
pub struct ResilientEmbedder {
    inner: Box<dyn Embedder>,
    max_retries: u32,
    backoff: Duration,
    timeout: Duration,
}

impl ResilientEmbedder {
    pub fn new(inner: Box<dyn Embedder>, max_retries: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
            timeout,
        }
    }

    pub fn from_config(inner: Box<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self::new(
            inner,
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
            Duration::from_secs(config.timeout_secs),
        )
    }

    async fn attempt(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let vectors = match tokio::time::timeout(self.timeout, self.inner.embed(texts)).await {
            Ok(result) => result?,
            Err(_) => return Err(EmbeddingError::Timeout(self.timeout)),
        };
        validate_batch(&vectors, texts.len(), self.inner.dims())?;
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for ResilientEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut attempt = 0u32;
        loop {
            match self.attempt(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    // Exponential backoff: base, 2x, 4x, ... capped at 32x
                    let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                    warn!(
                        model = self.inner.model_name(),
                        attempt,
                        error = %e,
                        ?delay,
                        "embedding failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Per-item result of [`embed_batch`].
#[derive(Debug)]
pub struct BatchOutcome {
    /// One slot per input, `None` where that input failed.
    pub vectors: Vec<Option<Vec<f32>>>,
    /// `(input index, error)` for every failed input.
    pub errors: Vec<(usize, EmbeddingError)>,
}

impl BatchOutcome {
    fn all_failed(len: usize, error: EmbeddingError) -> Self {
        Self {
            vectors: vec![None; len],
            errors: (0..len).map(|i| (i, error.clone())).collect(),
        }
    }
}

/// Embed one batch, isolating failures to the inputs that caused them.
///
/// When the provider rejects the whole batch (a non-retryable error), each
/// input is retried on its own so one bad input does not cost the others.
/// When the provider is unavailable (retries exhausted, disabled) every
/// input fails with that error; re-trying them one by one would only
/// multiply the wait.
pub async fn embed_batch(embedder: &dyn Embedder, texts: &[String]) -> BatchOutcome {
    let error = match embedder.embed(texts).await {
        Ok(vectors) => {
            return BatchOutcome {
                vectors: vectors.into_iter().map(Some).collect(),
                errors: Vec::new(),
            }
        }
        Err(e) => e,
    };

    if texts.len() <= 1 || error.is_retryable() || error == EmbeddingError::Disabled {
        return BatchOutcome::all_failed(texts.len(), error);
    }

    debug!(batch = texts.len(), error = %error, "batch rejected; embedding items one by one");
    let mut outcome = BatchOutcome {
        vectors: Vec::with_capacity(texts.len()),
        errors: Vec::new(),
    };
    for (i, text) in texts.iter().enumerate() {
        match embedder.embed(std::slice::from_ref(text)).await {
            Ok(mut v) if v.len() == 1 => outcome.vectors.push(v.pop()),
            Ok(v) => {
                outcome.vectors.push(None);
                outcome.errors.push((
                    i,
                    EmbeddingError::CountMismatch {
                        expected: 1,
                        actual: v.len(),
                    },
                ));
            }
            Err(e) => {
                outcome.vectors.push(None);
                outcome.errors.push((i, e));
            }
        }
    }
    outcome
}

/// Build the configured provider wrapped in a [`ResilientEmbedder`].
///
/// # Errors
///
/// Returns an error for unknown provider names or if the provider
/// cannot be initialized (missing config, API key, or feature flag).
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    let inner: Box<dyn Embedder> = match config.provider.as_str() {
        "disabled" => Box::new(DisabledEmbedder {
            dims: config.dims.unwrap_or(0),
        }),
        "openai" => Box::new(OpenAiEmbedder::new(config)?),
        "ollama" => Box::new(OllamaEmbedder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Box::new(LocalEmbedder::new(config)?),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Box::new(ResilientEmbedder::from_config(inner, config)))
}
