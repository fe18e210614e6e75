//! Hybrid rerank: vector similarity, graph support, recency and source authority.

use chrono::{DateTime, NaiveDate, Utc};
use index::VectorCandidate;

use crate::config::PipelineConfig;
use crate::state::GraphFact;

/// Trust in a source by document type.
pub fn authority_score(doc_type: Option<&str>) -> f32 {
    match doc_type {
        Some("OEM_MANUAL") => 1.0,
        Some("STANDARD") => 0.95,
        Some("SOP") => 0.9,
        Some("BULLETIN") => 0.85,
        Some("RCA") => 0.8,
        _ => 0.7,
    }
}

fn parse_effective_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

/// Linear decay from 1 (today or later) to 0 at `horizon_years`. Unknown dates get `neutral`.
pub fn recency_score(effective_date: Option<&str>, now: DateTime<Utc>, neutral: f32, horizon_years: f32) -> f32 {
    let Some(date) = effective_date.and_then(parse_effective_date) else {
        return neutral;
    };
    if horizon_years <= 0.0 {
        return neutral;
    }
    let age_years = (now - date).num_days().max(0) as f32 / 365.25;
    (1.0 - age_years / horizon_years).clamp(0.0, 1.0)
}

/// 0.1 per graph node (id or name) mentioned in `content`, capped at 1.
pub fn graph_relevance(content: &str, facts: &[GraphFact]) -> f32 {
    let content = content.to_lowercase();
    let mut hits = 0usize;

    for fact in facts {
        for (i, node_id) in fact.source_nodes.iter().enumerate() {
            let name = fact.path.nodes.get(i).map(|n| n.name.as_str()).unwrap_or_default();
            let mentioned = [node_id.as_str(), name]
                .iter()
                .any(|key| !key.is_empty() && content.contains(&key.to_lowercase()));
            if mentioned {
                hits += 1;
            }
        }
    }

    (hits as f32 * 0.1).min(1.0)
}

pub fn hybrid_score(
    candidate: &VectorCandidate,
    facts: &[GraphFact],
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> f32 {
    let weights = config.rerank;
    let recency = recency_score(
        candidate.metadata_str("effective_date"),
        now,
        config.neutral_recency,
        config.recency_horizon_years,
    );

    weights.vector * candidate.score
        + weights.graph * graph_relevance(&candidate.content, facts)
        + weights.recency * recency
        + weights.authority * authority_score(candidate.metadata_str("doc_type"))
}

/// Rescore, sort descending and keep the top `rerank_top_k`. Equal scores keep recall order.
pub fn rerank(
    candidates: &[VectorCandidate],
    facts: &[GraphFact],
    config: &PipelineConfig,
    now: DateTime<Utc>,
) -> Vec<VectorCandidate> {
    let mut scored: Vec<VectorCandidate> = candidates
        .iter()
        .map(|c| c.with_score(hybrid_score(c, facts, config, now)))
        .collect();

    // sort_by is stable
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(config.rerank_top_k);
    scored
}
