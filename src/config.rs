//! TOML configuration.
//!
//! ```toml
//! [service]
//! endpoint = "https://my-search.search.windows.net"
//! index = "code-index"
//! api_key_env = "SEARCH_API_KEY"
//!
//! [embedding]
//! provider = "azure"
//! url = "https://my-openai.openai.azure.com"
//! deployment = "text-embedding-3-small"
//! dims = 1536
//!
//! [pipeline]
//! batch_size = 1000
//! workers = 4
//!
//! [corpus]
//! root = "./src"
//! include_globs = ["**/*.rs"]
//! ```
//!
//! Only `[service]` is required. Every other section falls back to the
//! defaults below.

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::schema::{default_schema, SchemaDefinition};
use crate::transport::{RetryPolicy, TransportConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub index: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Inline key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_api_version() -> String {
    "2024-07-01".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    16_000
}

impl ServiceConfig {
    /// Transport settings; the API key is resolved here, from the inline
    /// value or the named environment variable.
    pub fn transport_config(&self) -> TransportConfig {
        let api_key = self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        });
        TransportConfig {
            endpoint: self.endpoint.clone(),
            api_version: self.api_version.clone(),
            api_key: api_key.map(SecretString::from),
            timeout: Duration::from_secs(self.timeout_secs),
            retry: RetryPolicy::new(
                self.max_attempts,
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            ),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL: OpenAI-compatible API root, or the Azure resource endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Azure deployment name.
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Max texts per provider HTTP request.
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embed_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            deployment: None,
            api_version: None,
            api_key: None,
            api_key_env: None,
            batch_size: default_embed_batch_size(),
            max_attempts: default_embed_attempts(),
            timeout_secs: default_timeout_secs(),
            initial_backoff_ms: default_embed_backoff_ms(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_embed_attempts() -> u32 {
    5
}
fn default_embed_backoff_ms() -> u64 {
    1000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    10_000
}
fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Batch pipeline settings.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_batch_size")]
    pub batch_size: usize,
    /// Groups in flight at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per group on whole-group transient failures.
    #[serde(default = "default_group_attempts")]
    pub group_attempts: u32,
    #[serde(default = "default_group_backoff_ms")]
    pub group_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_pipeline_batch_size(),
            workers: default_workers(),
            group_attempts: default_group_attempts(),
            group_backoff_ms: default_group_backoff_ms(),
        }
    }
}

fn default_pipeline_batch_size() -> usize {
    1000
}
fn default_workers() -> usize {
    4
}
fn default_group_attempts() -> u32 {
    3
}
fn default_group_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReindexConfig {
    /// When false, a schema change that needs a rebuild is an error
    /// instead of a FullRebuild.
    #[serde(default = "default_true")]
    pub allow_full_rebuild: bool,
    /// Remote indexer to delegate incremental runs to.
    #[serde(default)]
    pub indexer: Option<String>,
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
    #[serde(default)]
    pub storage_quota_bytes: Option<u64>,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            allow_full_rebuild: true,
            indexer: None,
            manifest_path: None,
            storage_quota_bytes: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Value of the `repository` field on every document.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            repository: None,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchemaConfig {
    /// JSON index definition replacing the built-in schema.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// The schema reindexing converges on, named after `service.index`.
    pub fn desired_schema(&self) -> Result<SchemaDefinition> {
        let mut schema = match self.schema.path {
            Some(ref path) => SchemaDefinition::from_json_file(path)
                .with_context(|| format!("Failed to load schema: {}", path.display()))?,
            None => {
                let dims = if self.embedding.is_enabled() {
                    self.embedding.dims.unwrap_or(0) as u32
                } else {
                    0
                };
                default_schema(&self.service.index, dims)
            }
        };
        schema.name = self.service.index.clone();
        schema.validate()?;
        Ok(schema)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.service.endpoint.trim().is_empty() {
        bail!("service.endpoint must not be empty");
    }
    if config.service.index.trim().is_empty() {
        bail!("service.index must not be empty");
    }
    if config.service.max_attempts == 0 {
        bail!("service.max_attempts must be >= 1");
    }

    if config.pipeline.batch_size == 0 {
        bail!("pipeline.batch_size must be > 0");
    }
    if config.pipeline.workers == 0 {
        bail!("pipeline.workers must be > 0");
    }
    if config.pipeline.group_attempts == 0 {
        bail!("pipeline.group_attempts must be >= 1");
    }
    if config.cache.capacity == 0 {
        bail!("cache.capacity must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "azure" | "mock" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, azure, or mock.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_attempts == 0 {
            bail!("embedding.max_attempts must be >= 1");
        }
        match config.embedding.provider.as_str() {
            "openai" if config.embedding.model.is_none() => {
                bail!("embedding.model must be specified when provider is 'openai'")
            }
            "azure" if config.embedding.url.is_none() => {
                bail!("embedding.url must be specified when provider is 'azure'")
            }
            _ => {}
        }
    }

    Ok(())
}
