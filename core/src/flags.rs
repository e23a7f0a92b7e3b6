use crate::config::RetrievalConfig;
use serde::{Deserialize, Serialize};

/// Per-request snapshot of the pipeline feature flags. Taken once when a
/// request enters the system and never re-read mid-pipeline, so a config
/// reload cannot leave a single request half-reranked or half-diversified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeatureFlags {
    pub cross_encoder_reranking: bool,
    pub dynamic_match_count: bool,
    pub chunk_diversification: bool,
}

impl FeatureFlags {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            cross_encoder_reranking: config.enable_cross_encoder_reranking,
            dynamic_match_count: config.enable_dynamic_match_count,
            chunk_diversification: config.enable_chunk_diversification,
        }
    }

    pub fn all_enabled() -> Self {
        Self {
            cross_encoder_reranking: true,
            dynamic_match_count: true,
            chunk_diversification: true,
        }
    }
}
