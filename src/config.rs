//! TOML configuration.
//!
//! Only `[db]` is required. Every other section falls back to defaults
//! suitable for a local run: in-memory vectors, embeddings and the language
//! model disabled, and the reference retrieval constants.
//!
//! ```toml
//! [db]
//! path = "./data/ragchat.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [vector_store]
//! provider = "qdrant"
//! url = "http://localhost:6333"
//!
//! [resilience.llm]
//! max_attempts = 2
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rag_chat_core::chunk::ChunkConfig;
use rag_chat_core::error::Dependency;
use rag_chat_core::ranking::RetrievalParams;

use crate::resilience::{BreakerConfig, RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upper bound on one chat turn, retrieval and generation included.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_turn_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
    /// Divisor for the character-ratio token estimate.
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
            chars_per_token: default_chars_per_token(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            max_tokens: self.max_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }
}

fn default_max_tokens() -> usize {
    600
}
fn default_chars_per_token() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_context_chunks")]
    pub max_context_chunks: usize,
    #[serde(default = "default_max_cited_urls")]
    pub max_cited_urls: usize,
    /// Knowledge spaces searched at once during one turn.
    #[serde(default = "default_concurrency")]
    pub search_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            max_context_chunks: default_max_context_chunks(),
            max_cited_urls: default_max_cited_urls(),
            search_concurrency: default_concurrency(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            top_k: self.top_k,
            similarity_threshold: self.similarity_threshold,
            max_context_chunks: self.max_context_chunks,
            max_cited_urls: self.max_cited_urls,
        }
    }
}

fn default_top_k() -> usize {
    rag_chat_core::ranking::DEFAULT_TOP_K
}
fn default_similarity_threshold() -> f32 {
    rag_chat_core::ranking::DEFAULT_SIMILARITY_THRESHOLD
}
fn default_max_context_chunks() -> usize {
    rag_chat_core::ranking::DEFAULT_MAX_CONTEXT_CHUNKS
}
fn default_max_cited_urls() -> usize {
    rag_chat_core::ranking::DEFAULT_MAX_CITED_URLS
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Source URLs processed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_source_urls")]
    pub max_source_urls: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_source_urls: default_max_source_urls(),
        }
    }
}

fn default_max_source_urls() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled` or `openai`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            base_url: default_openai_base_url(),
            api_key_env: default_openai_key_env(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            base_url: default_openai_base_url(),
            api_key_env: default_openai_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_temperature() -> f32 {
    0.2
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// `memory` or `qdrant`.
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    /// Env var holding the Qdrant API key; unset means no `api-key` header.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_vector_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            url: default_qdrant_url(),
            api_key_env: None,
            timeout_secs: default_vector_timeout_secs(),
        }
    }
}

impl VectorStoreConfig {
    /// Whether vectors outlive the process that wrote them.
    pub fn is_persistent(&self) -> bool {
        self.provider != "memory"
    }
}

fn default_vector_provider() -> String {
    "memory".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_vector_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_crawler_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_crawler_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_crawler_timeout_secs() -> u64 {
    10
}
fn default_user_agent() -> String {
    concat!("ragchat/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Breaker thresholds plus a retry budget per dependency.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub crawler: RetrySettings,
    #[serde(default)]
    pub embedder: RetrySettings,
    #[serde(default)]
    pub vector_store: RetrySettings,
    #[serde(default)]
    pub llm: RetrySettings,
}

impl ResilienceConfig {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
        }
    }

    pub fn retry_policy(&self, dependency: Dependency) -> RetryPolicy {
        let settings = match dependency {
            Dependency::Crawler => &self.crawler,
            Dependency::Embedder => &self.embedder,
            Dependency::VectorStore => &self.vector_store,
            Dependency::LanguageModel => &self.llm,
        };
        settings.policy()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content).with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Parse and validate a TOML config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    if config.chunking.chars_per_token == 0 {
        anyhow::bail!("chunking.chars_per_token must be > 0");
    }

    // Retrieval
    let r = &config.retrieval;
    if r.top_k == 0 || r.max_context_chunks == 0 || r.search_concurrency == 0 {
        anyhow::bail!("retrieval.top_k, max_context_chunks and search_concurrency must be >= 1");
    }

    // Ingestion
    if config.ingestion.concurrency == 0 {
        anyhow::bail!("ingestion.concurrency must be >= 1");
    }
    if config.ingestion.max_source_urls == 0 {
        anyhow::bail!("ingestion.max_source_urls must be >= 1");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be >= 1");
    }

    // LLM
    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                anyhow::bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!("Unknown llm provider: '{}'. Must be disabled or openai.", other),
    }

    // Vector store
    match config.vector_store.provider.as_str() {
        "memory" => {}
        "qdrant" => {
            if !config.embedding.is_enabled() {
                anyhow::bail!("vector_store.provider 'qdrant' requires an embedding provider");
            }
        }
        other => anyhow::bail!(
            "Unknown vector_store provider: '{}'. Must be memory or qdrant.",
            other
        ),
    }

    // Resilience
    if config.resilience.breaker.failure_threshold == 0 {
        anyhow::bail!("resilience.breaker.failure_threshold must be >= 1");
    }
    for dependency in Dependency::ALL {
        let policy = config.resilience.retry_policy(dependency);
        if policy.max_attempts == 0 {
            anyhow::bail!("resilience.{}.max_attempts must be >= 1", dependency);
        }
        if policy.backoff_multiplier < 1.0 {
            anyhow::bail!("resilience.{}.backoff_multiplier must be >= 1.0", dependency);
        }
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown logging.format: '{}'. Must be text or json.", other),
    }

    Ok(())
}
