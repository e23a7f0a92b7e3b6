use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model_dim")]
    pub embedding_model_dim: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            embedding_model_dim: default_embedding_model_dim(),
            embedding_batch_size: default_embedding_batch_size(),
            max_concurrency: default_embedding_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default = "default_match_count")]
    pub match_count_default: usize,
    #[serde(default = "default_match_count_min")]
    pub match_count_min: usize,
    #[serde(default = "default_match_count_max")]
    pub match_count_max: usize,
    #[serde(default = "default_over_retrieve_factor")]
    pub over_retrieve_factor: usize,
    #[serde(default = "default_rerank_threshold")]
    pub rerank_threshold: f32,
    #[serde(default = "default_diversify_max_per_document")]
    pub diversify_max_per_document: usize,
    #[serde(default = "default_diversify_preserve_top_n")]
    pub diversify_preserve_top_n: usize,
    #[serde(default)]
    pub enable_cross_encoder_reranking: bool,
    #[serde(default)]
    pub enable_dynamic_match_count: bool,
    #[serde(default)]
    pub enable_chunk_diversification: bool,
    #[serde(default = "default_retrieval_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_breaker_latency_threshold_ms")]
    pub breaker_latency_threshold_ms: u64,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default = "default_cross_encoder_concurrency")]
    pub cross_encoder_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            match_count_default: default_match_count(),
            match_count_min: default_match_count_min(),
            match_count_max: default_match_count_max(),
            over_retrieve_factor: default_over_retrieve_factor(),
            rerank_threshold: default_rerank_threshold(),
            diversify_max_per_document: default_diversify_max_per_document(),
            diversify_preserve_top_n: default_diversify_preserve_top_n(),
            enable_cross_encoder_reranking: false,
            enable_dynamic_match_count: false,
            enable_chunk_diversification: false,
            deadline_ms: default_retrieval_deadline_ms(),
            breaker_latency_threshold_ms: default_breaker_latency_threshold_ms(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            cross_encoder_concurrency: default_cross_encoder_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_excerpt_max_chars")]
    pub excerpt_max_chars: usize,
    #[serde(default = "default_llm_deadline_ms")]
    pub llm_deadline_ms: u64,
    #[serde(default = "default_ag_latency_max_samples")]
    pub ag_latency_max_samples: usize,
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    #[serde(default = "default_session_rate_limit")]
    pub session_rate_limit_per_minute: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            history_turns: default_history_turns(),
            excerpt_max_chars: default_excerpt_max_chars(),
            llm_deadline_ms: default_llm_deadline_ms(),
            ag_latency_max_samples: default_ag_latency_max_samples(),
            llm_concurrency: default_llm_concurrency(),
            session_rate_limit_per_minute: default_session_rate_limit(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_ingestion_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_classification_cache_enabled")]
    pub classification_cache_enabled: bool,
    #[serde(default = "default_classification_cache_ttl_seconds")]
    pub classification_cache_ttl_seconds: u64,
    #[serde(default = "default_classification_confidence_floor")]
    pub classification_confidence_floor: f32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_ingestion_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            classification_cache_enabled: default_classification_cache_enabled(),
            classification_cache_ttl_seconds: default_classification_cache_ttl_seconds(),
            classification_confidence_floor: default_classification_confidence_floor(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("FISIORAG").separator("__"));

        builder.build()?.try_deserialize()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_embedding_model_dim() -> usize {
    1536
}
fn default_embedding_batch_size() -> usize {
    100
}
fn default_embedding_concurrency() -> usize {
    8
}
fn default_match_threshold() -> f32 {
    0.75
}
fn default_match_count() -> usize {
    8
}
fn default_match_count_min() -> usize {
    5
}
fn default_match_count_max() -> usize {
    12
}
fn default_over_retrieve_factor() -> usize {
    3
}
fn default_rerank_threshold() -> f32 {
    0.6
}
fn default_diversify_max_per_document() -> usize {
    2
}
fn default_diversify_preserve_top_n() -> usize {
    3
}
fn default_retrieval_deadline_ms() -> u64 {
    2000
}
fn default_breaker_latency_threshold_ms() -> u64 {
    2000
}
fn default_breaker_cooldown_ms() -> u64 {
    60_000
}
fn default_cross_encoder_concurrency() -> usize {
    4
}
fn default_history_turns() -> usize {
    10
}
fn default_excerpt_max_chars() -> usize {
    1200
}
fn default_llm_deadline_ms() -> u64 {
    30_000
}
fn default_ag_latency_max_samples() -> usize {
    200
}
fn default_llm_concurrency() -> usize {
    8
}
fn default_session_rate_limit() -> u32 {
    20
}
fn default_ingestion_max_retries() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    200
}
fn default_classification_cache_enabled() -> bool {
    true
}
fn default_classification_cache_ttl_seconds() -> u64 {
    604_800
}
fn default_classification_confidence_floor() -> f32 {
    0.7
}
