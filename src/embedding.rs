//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: any OpenAI-compatible `/embeddings` endpoint.
//! - **[`AzureOpenAIProvider`]**: an Azure OpenAI embedding deployment.
//! - **[`MockProvider`]**: deterministic vectors with call counting, for tests.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider from
//! configuration. Selection happens once, at construction time:
//!
//! ```rust
//! # use index_harness::config::EmbeddingConfig;
//! # use index_harness::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```
//!
//! # Retry Strategy
//!
//! The HTTP providers share the transport's [`RetryPolicy`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//!
//! Whatever the final cause, a failed call surfaces as
//! [`IndexError::ProviderUnavailable`].

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};
use crate::transport::RetryPolicy;

/// Trait for embedding providers.
///
/// `embed_batch` returns one vector per input text, in input order, each
/// of length [`dims`](EmbeddingProvider::dims).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(IndexError::ProviderUnavailable {
            provider: "disabled".to_string(),
            message: "embedding provider is disabled".to_string(),
        })
    }
}

// ============ HTTP Providers ============

enum Auth {
    Bearer(SecretString),
    ApiKey(SecretString),
    None,
}

/// Shared request loop for OpenAI-shaped embedding endpoints.
struct EmbeddingEndpoint {
    client: reqwest::Client,
    url: String,
    auth: Auth,
    retry: RetryPolicy,
    /// Max inputs per HTTP request.
    request_size: usize,
}

impl EmbeddingEndpoint {
    fn new(url: String, auth: Auth, config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IndexError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url,
            auth,
            retry: RetryPolicy::new(
                config.max_attempts,
                Duration::from_millis(config.initial_backoff_ms),
                Duration::from_secs(32),
            ),
            request_size: config.batch_size.max(1),
        })
    }

    async fn embed(
        &self,
        provider: &str,
        model: Option<&str>,
        dims: usize,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for part in texts.chunks(self.request_size) {
            let vectors = self
                .request(provider, model, part)
                .await
                .map_err(|e| match e {
                    IndexError::ProviderUnavailable { .. } => e,
                    other => IndexError::ProviderUnavailable {
                        provider: provider.to_string(),
                        message: other.to_string(),
                    },
                })?;
            check_shape(provider, dims, part.len(), &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn request(&self, provider: &str, model: Option<&str>, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = json!({ "input": texts });
        if let Some(model) = model {
            body["model"] = json!(model);
        }
        let label = format!("embed({}, {} texts)", provider, texts.len());

        self.retry
            .run(&label, |attempt| {
                let body = &body;
                let label = &label;
                async move {
                    debug!(operation = %label, attempt, "requesting embeddings");
                    let mut req = self
                        .client
                        .post(&self.url)
                        .header("Content-Type", "application/json")
                        .json(body);
                    req = match &self.auth {
                        Auth::Bearer(key) => {
                            req.header("Authorization", format!("Bearer {}", key.expose_secret()))
                        }
                        Auth::ApiKey(key) => req.header("api-key", key.expose_secret()),
                        Auth::None => req,
                    };

                    let response = req.send().await.map_err(|e| IndexError::Transient {
                        operation: label.clone(),
                        status: None,
                        message: e.to_string(),
                    })?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(IndexError::from_status(label.as_str(), status.as_u16(), text));
                    }
                    let parsed: EmbeddingResponse =
                        response.json().await.map_err(|e| IndexError::Decode {
                            operation: label.clone(),
                            message: e.to_string(),
                        })?;
                    Ok(parsed.into_vectors())
                }
            })
            .await
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    /// Vectors ordered by their `index` field.
    fn into_vectors(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|item| item.index);
        self.data.into_iter().map(|item| item.embedding).collect()
    }
}

fn check_shape(provider: &str, dims: usize, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        return Err(IndexError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("expected {} vectors, got {}", expected, vectors.len()),
        });
    }
    if dims > 0 {
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(IndexError::ProviderUnavailable {
                provider: provider.to_string(),
                message: format!("expected {} dimensions, got {}", dims, bad.len()),
            });
        }
    }
    Ok(())
}

fn resolve_key(config: &EmbeddingConfig, default_env: &str) -> Option<SecretString> {
    if let Some(ref key) = config.api_key {
        return Some(SecretString::from(key.clone()));
    }
    let var = config.api_key_env.as_deref().unwrap_or(default_env);
    std::env::var(var).ok().map(SecretString::from)
}

fn required_dims(config: &EmbeddingConfig, provider: &str) -> Result<usize> {
    config
        .dims
        .filter(|d| *d > 0)
        .ok_or_else(|| IndexError::Config(format!("embedding.dims required for {} provider", provider)))
}

/// Embedding provider for OpenAI-compatible APIs.
///
/// Calls `POST {url}/embeddings` (default `https://api.openai.com/v1`)
/// with a bearer token. Works against OpenAI itself and against
/// compatible gateways such as Ollama's `/v1` or vLLM.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    endpoint: EmbeddingEndpoint,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| IndexError::Config("embedding.model required for openai provider".into()))?;
        let dims = required_dims(config, "openai")?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let auth = match resolve_key(config, "OPENAI_API_KEY") {
            Some(key) => Auth::Bearer(key),
            None if config.url.is_some() => Auth::None,
            None => {
                return Err(IndexError::Config(
                    "OPENAI_API_KEY environment variable not set".to_string(),
                ))
            }
        };
        let url = format!("{}/embeddings", base.trim_end_matches('/'));
        Ok(Self {
            model,
            dims,
            endpoint: EmbeddingEndpoint::new(url, auth, config)?,
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
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.endpoint
            .embed("openai", Some(&self.model), self.dims, texts)
            .await
    }
}

/// Embedding provider for an Azure OpenAI deployment.
///
/// Calls `POST {url}/openai/deployments/{deployment}/embeddings?api-version=...`
/// with the `api-key` header. The model is implied by the deployment.
pub struct AzureOpenAIProvider {
    deployment: String,
    dims: usize,
    endpoint: EmbeddingEndpoint,
}

impl AzureOpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base = config
            .url
            .clone()
            .ok_or_else(|| IndexError::Config("embedding.url required for azure provider".into()))?;
        let deployment = config
            .deployment
            .clone()
            .or_else(|| config.model.clone())
            .ok_or_else(|| {
                IndexError::Config("embedding.deployment required for azure provider".into())
            })?;
        let dims = required_dims(config, "azure")?;
        let key = resolve_key(config, "AZURE_OPENAI_API_KEY").ok_or_else(|| {
            IndexError::Config("AZURE_OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let api_version = config
            .api_version
            .clone()
            .unwrap_or_else(|| "2024-02-01".to_string());
        let url = format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            base.trim_end_matches('/'),
            deployment,
            api_version
        );
        Ok(Self {
            deployment,
            dims,
            endpoint: EmbeddingEndpoint::new(url, Auth::ApiKey(key), config)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for AzureOpenAIProvider {
    fn model_name(&self) -> &str {
        &self.deployment
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.endpoint.embed("azure", None, self.dims, texts).await
    }
}

// ============ Mock Provider ============

/// Deterministic provider that derives vectors from a hash of the text.
///
/// Counts calls and can be told to fail, which makes cache and pipeline
/// behaviour observable in tests.
pub struct MockProvider {
    dims: usize,
    calls: AtomicUsize,
    texts: AtomicUsize,
    fail_always: AtomicBool,
    fail_next: AtomicU32,
}

impl MockProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Number of `embed_batch` calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of texts embedded successfully.
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_always.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// The vector this provider returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        (0..self.dims)
            .map(|i| digest[i % digest.len()] as f32 / 255.0)
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.fail_always.load(Ordering::SeqCst) {
            return Err(IndexError::ProviderUnavailable {
                provider: "mock".to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// # Supported Providers
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"azure"` | [`AzureOpenAIProvider`] |
/// | `"mock"` | [`MockProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "azure" => Ok(Arc::new(AzureOpenAIProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockProvider::new(required_dims(config, "mock")?))),
        other => Err(IndexError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_fails() {
        let err = DisabledProvider
            .embed_batch(&["x".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn mock_provider_is_deterministic_and_scriptable() {
        let p = MockProvider::new(6);
        let a = p.embed_batch(&["hello".to_string()]).await.unwrap();
        let b = p.embed_batch(&["hello".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 6);

        p.fail_next(1);
        assert!(p.embed_batch(&["x".to_string()]).await.is_err());
        assert!(p.embed_batch(&["x".to_string()]).await.is_ok());
        assert_eq!(p.calls(), 4);
        assert_eq!(p.texts_embedded(), 3);
    }

    #[test]
    fn response_is_reordered_by_index() {
        let json = r#"{"data":[{"index":1,"embedding":[2.0]},{"index":0,"embedding":[1.0]}]}"#;
        let parsed: EmbeddingResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.into_vectors(), vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn shape_mismatch_is_provider_failure() {
        assert!(check_shape("p", 2, 2, &[vec![1.0, 2.0]]).is_err());
        assert!(check_shape("p", 2, 1, &[vec![1.0]]).is_err());
        assert!(check_shape("p", 2, 1, &[vec![1.0, 2.0]]).is_ok());
    }

    #[test]
    fn create_provider_validates() {
        let mut config = EmbeddingConfig {
            provider: "azure".into(),
            ..Default::default()
        };
        assert!(create_provider(&config).is_err());

        config.provider = "nope".into();
        assert!(create_provider(&config).is_err());

        config.provider = "mock".into();
        config.dims = Some(4);
        assert_eq!(create_provider(&config).unwrap().dims(), 4);
    }
}
