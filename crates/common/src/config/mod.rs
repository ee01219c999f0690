//! Configuration management for LexForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values
//!
//! Every recognised option is a typed field; `validate` rejects
//! combinations the engine cannot run with.

use crate::errors::{AppError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Document index database (absent means in-memory index)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis configuration (feedback log)
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Hybrid retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Query router configuration
    #[serde(default)]
    pub router: RouterConfig,

    /// Answer cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Conversational memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Generation providers
    #[serde(default)]
    pub llm: LlmConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create the documents table and its indexes at startup
    #[serde(default = "default_enabled")]
    pub migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,

    /// Key the feedback log is appended to
    #[serde(default = "default_feedback_key")]
    pub feedback_key: String,
}

/// Embedding provider selection
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// OpenAI-compatible `/embeddings` endpoint
    Openai,
    /// Deterministic feature hashing, no network
    Hashing,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProvider,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

/// How dense and keyword result sets are combined
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    /// Weighted sum of normalized similarity and keyword overlap
    Weighted,
    /// Reciprocal rank fusion
    Rrf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Candidates requested from the dense leg
    #[serde(default = "default_dense_top_k")]
    pub dense_top_k: usize,

    /// Candidates requested from the keyword leg
    #[serde(default = "default_keyword_top_k")]
    pub keyword_top_k: usize,

    /// Upper bound on documents returned per query
    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,

    #[serde(default = "default_fusion")]
    pub fusion: FusionStrategy,

    /// Weight of vector similarity in weighted fusion
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,

    /// Weight of keyword overlap in weighted fusion
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// RRF constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    /// Jaccard similarity above which passages are near-duplicates
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,

    /// Minimum fused score kept
    #[serde(default)]
    pub min_score: f32,

    /// Timeout for each index lookup and the query embedding
    #[serde(default = "default_index_timeout")]
    pub index_timeout_ms: u64,

    #[serde(default)]
    pub rerank: RerankConfig,

    /// JSON corpus loaded into the in-memory index when no database is configured
    #[serde(default)]
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cross-encoder endpoint (`POST {query, texts}`)
    pub endpoint: Option<String>,

    /// Number of fused candidates sent for reranking
    #[serde(default = "default_rerank_top_n")]
    pub top_n: usize,

    #[serde(default = "default_rerank_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Ask the generator to classify non-trivial queries
    #[serde(default = "default_enabled")]
    pub classifier_enabled: bool,

    /// Budget for the classification call
    #[serde(default = "default_router_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_router_max_tokens")]
    pub max_tokens: usize,
}

/// Whether cached answers are shared across sessions
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    Global,
    Session,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Time-to-live for finalized answers, in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Capacity before least-recently-used answers are evicted
    #[serde(default = "default_cache_capacity")]
    pub max_entries: u64,

    #[serde(default = "default_cache_scope")]
    pub scope: CacheScope,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Turns retained per session
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Character budget of the rendered context
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Sessions idle longer than this are evicted
    #[serde(default = "default_session_idle_ttl")]
    pub idle_ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Wire protocol of a generation provider
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions`
    Openai,
    /// Ollama `/api/chat`
    Ollama,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Name used in logs and metrics
    pub name: String,

    pub kind: ProviderKind,

    /// Base URL, e.g. https://api.openai.com/v1 or http://localhost:11434
    pub endpoint: String,

    pub api_key: Option<String>,

    pub model: String,

    /// Lower values are tried first
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Retries for transient failures before falling back
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a provider's circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit skips its provider
    #[serde(default = "default_open_secs")]
    pub open_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Sampling temperature for answers
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,

    #[serde(default)]
    pub circuit: CircuitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 60 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_feedback_key() -> String { "lexforge:feedback".to_string() }
fn default_embedding_provider() -> EmbeddingProvider { EmbeddingProvider::Hashing }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 384 }
fn default_embedding_timeout() -> u64 { 10 }
fn default_embedding_retries() -> u32 { 2 }
fn default_dense_top_k() -> usize { 20 }
fn default_keyword_top_k() -> usize { 20 }
fn default_final_top_k() -> usize { 8 }
fn default_fusion() -> FusionStrategy { FusionStrategy::Weighted }
fn default_vector_weight() -> f32 { 0.6 }
fn default_keyword_weight() -> f32 { 0.4 }
fn default_rrf_k() -> f32 { 60.0 }
fn default_dedup_threshold() -> f32 { 0.85 }
fn default_index_timeout() -> u64 { 3_000 }
fn default_rerank_top_n() -> usize { 12 }
fn default_rerank_timeout() -> u64 { 1_500 }
fn default_router_timeout() -> u64 { 2_000 }
fn default_router_max_tokens() -> usize { 160 }
fn default_cache_ttl() -> u64 { 3_600 }
fn default_cache_capacity() -> u64 { 10_000 }
fn default_cache_scope() -> CacheScope { CacheScope::Global }
fn default_max_turns() -> usize { 6 }
fn default_max_context_chars() -> usize { 4_000 }
fn default_session_idle_ttl() -> u64 { 1_800 }
fn default_sweep_interval() -> u64 { 60 }
fn default_provider_timeout() -> u64 { 45 }
fn default_provider_retries() -> u32 { 2 }
fn default_failure_threshold() -> u32 { 3 }
fn default_open_secs() -> u64 { 30 }
fn default_temperature() -> f32 { 0.2 }
fn default_llm_max_tokens() -> usize { 1_024 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "lexforge".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_top_k: default_dense_top_k(),
            keyword_top_k: default_keyword_top_k(),
            final_top_k: default_final_top_k(),
            fusion: default_fusion(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            rrf_k: default_rrf_k(),
            dedup_threshold: default_dedup_threshold(),
            min_score: 0.0,
            index_timeout_ms: default_index_timeout(),
            rerank: RerankConfig::default(),
            seed_path: None,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            top_n: default_rerank_top_n(),
            timeout_ms: default_rerank_timeout(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            classifier_enabled: default_enabled(),
            timeout_ms: default_router_timeout(),
            max_tokens: default_router_max_tokens(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_capacity(),
            scope: default_cache_scope(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_context_chars: default_max_context_chars(),
            idle_ttl_secs: default_session_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_secs: default_open_secs(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            temperature: default_temperature(),
            max_tokens: default_llm_max_tokens(),
            circuit: CircuitConfig::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: None,
            redis: None,
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            router: RouterConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
            llm: LlmConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__CACHE__TTL_SECS=600
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        let retrieval = &self.retrieval;

        for (name, weight) in [
            ("retrieval.vector_weight", retrieval.vector_weight),
            ("retrieval.keyword_weight", retrieval.keyword_weight),
            ("retrieval.dedup_threshold", retrieval.dedup_threshold),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(invalid(format!("{} must be within [0, 1], got {}", name, weight)));
            }
        }

        if retrieval.vector_weight + retrieval.keyword_weight <= 0.0 {
            return Err(invalid("retrieval weights must not both be zero"));
        }

        if retrieval.final_top_k == 0 || retrieval.dense_top_k == 0 || retrieval.keyword_top_k == 0 {
            return Err(invalid("retrieval top_k values must be positive"));
        }

        if retrieval.rerank.enabled {
            if retrieval.rerank.endpoint.is_none() {
                return Err(invalid("retrieval.rerank.endpoint is required when reranking is enabled"));
            }
            if retrieval.rerank.top_n < retrieval.final_top_k {
                return Err(invalid(format!(
                    "retrieval.rerank.top_n ({}) must be at least retrieval.final_top_k ({})",
                    retrieval.rerank.top_n, retrieval.final_top_k
                )));
            }
        }

        if self.cache.max_entries == 0 || self.cache.ttl_secs == 0 {
            return Err(invalid("cache.max_entries and cache.ttl_secs must be positive"));
        }

        if self.memory.max_turns == 0 || self.memory.max_context_chars == 0 {
            return Err(invalid("memory.max_turns and memory.max_context_chars must be positive"));
        }

        if self.llm.providers.is_empty() {
            return Err(invalid("llm.providers must list at least one provider"));
        }

        if self.llm.circuit.failure_threshold == 0 {
            return Err(invalid("llm.circuit.failure_threshold must be positive"));
        }

        if self.embedding.provider == EmbeddingProvider::Openai && self.embedding.api_key.is_none() {
            return Err(invalid("embedding.api_key is required for the openai provider"));
        }

        if self.embedding.dimension == 0 {
            return Err(invalid("embedding.dimension must be positive"));
        }

        if self.rate_limit.enabled && (self.rate_limit.requests_per_second == 0 || self.rate_limit.burst == 0) {
            return Err(invalid("rate_limit values must be positive when enabled"));
        }

        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl RetrievalConfig {
    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::Configuration { message: message.into() }
}
