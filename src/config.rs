//! TOML configuration.
//!
//! Every section is optional and falls back to the defaults below, so a
//! config file only needs the keys a deployment wants to change.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use knowledge_harness_core::normalize::NormalizeOptions;
use knowledge_harness_core::search::SearchOptions;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/kh.sqlite")
}
fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base URL override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    knowledge_harness_core::embedding::DEFAULT_DIMS
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub parallel_types: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_content_chars: default_max_content_chars(),
            min_content_chars: default_min_content_chars(),
            concurrency: default_concurrency(),
            parallel_types: false,
        }
    }
}

fn default_max_content_chars() -> usize {
    10_000
}
fn default_min_content_chars() -> usize {
    10
}
fn default_concurrency() -> usize {
    4
}

impl IndexingConfig {
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            max_content_chars: self.max_content_chars,
            min_content_chars: self.min_content_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f32,
    /// Keyword matching when no vector hit clears `min_relevance`.
    #[serde(default = "default_true")]
    pub text_fallback: bool,
    /// Server-side result cache lifetime. `0` disables the cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Cached responses kept per tenant.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Token budget for context assembly when a request names none.
    #[serde(default = "default_context_max_tokens")]
    pub context_max_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            min_relevance: default_min_relevance(),
            text_fallback: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            context_max_tokens: default_context_max_tokens(),
        }
    }
}

fn default_limit() -> usize {
    20
}
fn default_max_limit() -> usize {
    50
}
fn default_min_relevance() -> f32 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl_secs() -> u64 {
    60
}
fn default_cache_max_entries() -> usize {
    256
}
fn default_context_max_tokens() -> usize {
    knowledge_harness_core::context::DEFAULT_MAX_TOKENS
}

impl RetrievalConfig {
    pub fn search_options(&self) -> SearchOptions {
        SearchOptions {
            default_limit: self.default_limit,
            max_limit: self.max_limit,
            min_relevance: self.min_relevance,
            text_fallback: self.text_fallback,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: default_store_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

fn default_store_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourcesConfig {
    /// Directory holding `<tenant>/<entity_type>.json` exports.
    #[serde(default = "default_sources_root")]
    pub root: PathBuf,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            root: default_sources_root(),
        }
    }
}

fn default_sources_root() -> PathBuf {
    PathBuf::from("./data/exports")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_format() -> String {
    "text".to_string()
}

impl Config {
    /// All defaults, with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                ..DbConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.embedding.provider.as_str() {
            "hash" | "openai" | "ollama" | "disabled" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or disabled.",
                other
            ),
        }

        if self.embedding.is_enabled() && self.embedding.dims == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                self.embedding.provider
            );
        }

        if matches!(self.embedding.provider.as_str(), "openai" | "ollama")
            && self.embedding.model.is_none()
        {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                self.embedding.provider
            );
        }

        if self.indexing.min_content_chars == 0 {
            bail!("indexing.min_content_chars must be >= 1");
        }
        if self.indexing.max_content_chars <= self.indexing.min_content_chars {
            bail!("indexing.max_content_chars must be greater than indexing.min_content_chars");
        }
        if self.indexing.concurrency == 0 {
            bail!("indexing.concurrency must be >= 1");
        }

        if self.retrieval.default_limit == 0
            || self.retrieval.default_limit > self.retrieval.max_limit
        {
            bail!("retrieval.default_limit must be in 1..=retrieval.max_limit");
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_relevance) {
            bail!("retrieval.min_relevance must be in [0.0, 1.0]");
        }
        if self.retrieval.context_max_tokens == 0 {
            bail!("retrieval.context_max_tokens must be >= 1");
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => bail!("Unknown logging.format: '{}'. Must be text or json.", other),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
