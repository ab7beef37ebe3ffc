//! Embedding provider implementations and selection.
//!
//! The [`EmbeddingProvider`] trait and the deterministic [`HashEmbedder`]
//! live in `knowledge-harness-core`; this module adds:
//! - **[`DisabledProvider`]**: always errors; used when embeddings are turned off.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`TimeoutProvider`]**: bounds any provider's calls with a deadline.
//!
//! # Provider Selection
//!
//! ```rust
//! # use knowledge_harness::config::EmbeddingConfig;
//! # use knowledge_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "feature-hash-v1");
//! ```
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Hosted vectors are L2-normalized before they are returned, and a vector
//! whose length differs from the configured `dims` is rejected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use knowledge_harness_core::embedding::{check_dims, l2_normalize, HashEmbedder};
pub use knowledge_harness_core::embedding::EmbeddingProvider;
use knowledge_harness_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;

const OPENAI_URL: &str = "https://api.openai.com";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Build the provider named by `embedding.provider`, wrapped in a
/// [`TimeoutProvider`] using `embedding.timeout_secs`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let provider: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "hash" => Arc::new(TimeoutProvider::new(HashEmbedder::new(config.dims), timeout)),
        "openai" => Arc::new(TimeoutProvider::new(OpenAIProvider::new(config)?, timeout)),
        "ollama" => Arc::new(TimeoutProvider::new(OllamaProvider::new(config)?, timeout)),
        "disabled" => Arc::new(DisabledProvider::new(config.dims)),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(provider)
}

// ============ Disabled Provider ============

/// A provider that refuses every call.
///
/// Keeps the configured `dims` so that the store can still be opened and
/// inspected while embeddings are turned off.
pub struct DisabledProvider {
    dims: usize,
}

impl DisabledProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Timeout Wrapper ============

/// Bounds every call of the wrapped provider with `tokio::time::timeout`.
pub struct TimeoutProvider<P> {
    inner: P,
    timeout: Duration,
}

impl<P: EmbeddingProvider> TimeoutProvider<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for TimeoutProvider<P> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::timeout(self.timeout, self.inner.embed(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout.as_millis() as u64))?
    }
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::timeout(self.timeout, self.inner.embed_query(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout.as_millis() as u64))?
    }
}

// ============ Shared HTTP plumbing ============

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .build()?)
}

/// POST `body` to `url`, retrying 429/5xx and network errors with
/// exponential backoff. Returns the parsed JSON of the first success.
async fn post_with_retry(
    client: &reqwest::Client,
    label: &str,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
    max_retries: u32,
) -> Result<Value, EmbeddingError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(provider = label, attempt, ?delay, "retrying embedding request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| {
                        EmbeddingError::Provider(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(provider = label, %status, "transient embedding API error");
                    last_err = Some(EmbeddingError::Provider(format!(
                        "{} API error {}: {}",
                        label, status, body_text
                    )));
                    continue;
                }

                return Err(EmbeddingError::Provider(format!(
                    "{} API error {}: {}",
                    label, status, body_text
                )));
            }
            Err(e) => {
                warn!(provider = label, error = %e, "embedding API unreachable");
                last_err = Some(EmbeddingError::Unavailable(format!(
                    "{} connection error ({}): {}",
                    label, url, e
                )));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        EmbeddingError::Provider(format!("{} embedding failed after retries", label))
    }))
}

fn json_to_vec(value: &Value, label: &str) -> Result<Vec<f32>, EmbeddingError> {
    value
        .as_array()
        .ok_or_else(|| EmbeddingError::Provider(format!("Invalid {} response: embedding is not an array", label)))?
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                EmbeddingError::Provider(format!("Invalid {} response: non-numeric component", label))
            })
        })
        .collect()
}

/// Validate length and scale a hosted vector to unit length.
fn finish_vector(mut vec: Vec<f32>, dims: usize) -> Result<Vec<f32>, EmbeddingError> {
    check_dims(dims, &vec)?;
    if !l2_normalize(&mut vec) {
        return Err(EmbeddingError::Provider(
            "provider returned a zero or non-finite vector".to_string(),
        ));
    }
    Ok(vec)
}

/// Extract the first `data[].embedding` array of an OpenAI response.
fn parse_openai_response(json: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let first = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .ok_or_else(|| EmbeddingError::Provider("Invalid OpenAI response: missing data array".to_string()))?;
    let embedding = first
        .get("embedding")
        .ok_or_else(|| EmbeddingError::Provider("Invalid OpenAI response: missing embedding".to_string()))?;
    json_to_vec(embedding, "OpenAI")
}

/// Extract the first `embeddings[]` array of an Ollama response.
fn parse_ollama_response(json: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| {
            EmbeddingError::Provider("Invalid Ollama response: missing embeddings array".to_string())
        })?;
    json_to_vec(first, "Ollama")
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable. `embedding.url` points the
/// provider at an OpenAI-compatible gateway instead.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config, or if
    /// `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let base = config.url.as_deref().unwrap_or(OPENAI_URL).trim_end_matches('/');
        Ok(Self {
            model,
            dims: config.dims,
            url: format!("{}/v1/embeddings", base),
            api_key,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json = post_with_retry(
            &self.client,
            "OpenAI",
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
        )
        .await?;
        finish_vector(parse_openai_response(&json)?, self.dims)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires Ollama to be running with an
/// embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_URL).trim_end_matches('/');

        Ok(Self {
            model,
            dims: config.dims,
            url: format!("{}/api/embed", base),
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let json =
            post_with_retry(&self.client, "Ollama", &self.url, None, &body, self.max_retries).await?;
        finish_vector(parse_ollama_response(&json)?, self.dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0, 0.0])
        }
    }

    async fn spawn_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn ollama_config(url: String, dims: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims,
            timeout_secs: 5,
            max_retries: 0,
            url: Some(url),
        }
    }

    #[test]
    fn test_parse_openai_response() {
        let json = json!({ "data": [{ "embedding": [0.5, -0.5], "index": 0 }] });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![0.5, -0.5]);
        assert!(parse_openai_response(&json!({})).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = json!({ "embeddings": [[3.0, 4.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![3.0, 4.0]);
        assert!(parse_ollama_response(&json!({ "embeddings": ["x"] })).is_err());
    }

    #[test]
    fn test_finish_vector_normalizes_and_checks_dims() {
        let v = finish_vector(vec![3.0, 4.0], 2).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert_eq!(
            finish_vector(vec![1.0], 2).unwrap_err(),
            EmbeddingError::DimensionMismatch { expected: 2, actual: 1 }
        );
    }

    #[test]
    fn test_create_provider_variants() {
        let hash = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(hash.dims(), 1536);

        let disabled = create_provider(&EmbeddingConfig {
            provider: "disabled".to_string(),
            ..EmbeddingConfig::default()
        })
        .unwrap();
        assert_eq!(disabled.model_name(), "disabled");

        let unknown = create_provider(&EmbeddingConfig {
            provider: "nope".to_string(),
            ..EmbeddingConfig::default()
        });
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_is_unavailable() {
        let err = DisabledProvider::new(8).embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_provider_expires() {
        let provider = TimeoutProvider::new(SlowProvider, Duration::from_millis(20));
        assert_eq!(
            provider.embed("anything").await.unwrap_err(),
            EmbeddingError::Timeout(20)
        );
    }

    #[tokio::test]
    async fn test_ollama_provider_against_mock() {
        let router = Router::new().route(
            "/api/embed",
            post(|| async { Json(json!({ "embeddings": [[0.0, 2.0]] })) }),
        );
        let url = spawn_mock(router).await;
        let provider = OllamaProvider::new(&ollama_config(url, 2)).unwrap();
        assert_eq!(provider.embed("hello").await.unwrap(), vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_client_error_fails_fast() {
        let router = Router::new().route(
            "/api/embed",
            post(|| async { (StatusCode::BAD_REQUEST, "model not found") }),
        );
        let url = spawn_mock(router).await;
        let mut config = ollama_config(url, 2);
        config.max_retries = 5;
        let provider = OllamaProvider::new(&config).unwrap();

        let started = std::time::Instant::now();
        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Provider(ref m) if m.contains("400")));
        // no backoff sleeps happened
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wrong_dimension_from_provider_is_rejected() {
        let router = Router::new().route(
            "/api/embed",
            post(|| async { Json(json!({ "embeddings": [[1.0, 0.0, 0.0]] })) }),
        );
        let url = spawn_mock(router).await;
        let provider = OllamaProvider::new(&ollama_config(url, 2)).unwrap();
        assert_eq!(
            provider.embed("hello").await.unwrap_err(),
            EmbeddingError::DimensionMismatch { expected: 2, actual: 3 }
        );
    }
}
