use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one retrieval run. Defaults reproduce the production weights and sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Candidates requested from the vector store.
    pub recall_top_k: usize,
    /// Passages given to query-time entity extraction.
    pub extraction_passages: usize,
    /// Characters taken from each of those passages.
    pub extraction_passage_chars: usize,

    pub skip_vector_size: usize,
    pub skip_graph_size: usize,
    pub skip_rerank_size: usize,

    /// Extracted entities used as traversal seeds.
    pub max_seed_entities: usize,
    pub max_graph_facts: usize,
    /// Paths returned per traversal.
    pub traversal_path_limit: usize,
    pub traversal_concurrency: usize,
    pub traversal_timeout_ms: u64,

    pub rerank: RerankWeights,
    pub rerank_top_k: usize,
    /// Recency used when a passage carries no effective date.
    pub neutral_recency: f32,
    /// Age in years at which recency reaches zero.
    pub recency_horizon_years: f32,

    pub fusion: FusionWeights,
    pub fused_top_k: usize,
    /// Fused items numbered into the synthesis prompt.
    pub evidence_block_size: usize,

    pub synthesis_temperature: f32,
    pub synthesis_max_tokens: Option<u32>,
    pub confidence_floor: f32,
    pub max_guard_retries: u32,

    /// Applies to each gateway call on the critical path.
    pub gateway_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    pub vector: f32,
    pub graph: f32,
    pub recency: f32,
    pub authority: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self { vector: 0.35, graph: 0.30, recency: 0.15, authority: 0.20 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub vector: f32,
    pub graph: f32,
    pub rerank: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self { vector: 0.3, graph: 0.4, rerank: 0.3 }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recall_top_k: 50,
            extraction_passages: 5,
            extraction_passage_chars: 500,
            skip_vector_size: 10,
            skip_graph_size: 15,
            skip_rerank_size: 5,
            max_seed_entities: 10,
            max_graph_facts: 20,
            traversal_path_limit: 20,
            traversal_concurrency: 5,
            traversal_timeout_ms: 5_000,
            rerank: RerankWeights::default(),
            rerank_top_k: 10,
            neutral_recency: 0.5,
            recency_horizon_years: 10.0,
            fusion: FusionWeights::default(),
            fused_top_k: 20,
            evidence_block_size: 10,
            synthesis_temperature: 0.3,
            synthesis_max_tokens: Some(1024),
            confidence_floor: 0.30,
            max_guard_retries: 2,
            gateway_timeout_ms: 60_000,
        }
    }
}

impl PipelineConfig {
    pub fn traversal_timeout(&self) -> Duration {
        Duration::from_millis(self.traversal_timeout_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }
}
