use index::VectorCandidate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::state::{Citation, EvidencePack, GraphFact, PassageConflict, SafetyRule};

pub const EXCERPT_CHARS: usize = 200;

const SAFETY_KEYWORDS: &[&str] = &["warning", "caution", "danger", "ppe", "lockout", "hazard"];

/// Words that signal the user wants to get around a safety control.
const BYPASS_KEYWORDS: &[&str] = &["bypass", "override", "shortcut", "skip", "disable"];

/// Where the run goes after evidence assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRoute {
    Sufficient,
    Insufficient,
    SafetyCritical,
}

pub fn excerpt(content: &str) -> String {
    if content.chars().count() > EXCERPT_CHARS {
        let head: String = content.chars().take(EXCERPT_CHARS).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

/// One citation per document, in first-seen order.
pub fn build_citations(passages: &[VectorCandidate]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    passages
        .iter()
        .filter(|p| seen.insert(p.doc_id.as_str()))
        .map(|p| Citation {
            doc_id: p.doc_id.clone(),
            doc_title: p.metadata_str("title").map(str::to_string),
            section: p.metadata_str("section").map(str::to_string),
            page: p.metadata.get("page").and_then(|v| v.as_u64()),
            excerpt: excerpt(&p.content),
            relevance_score: p.score,
        })
        .collect()
}

pub fn is_safety_passage(content: &str) -> bool {
    let content = content.to_lowercase();
    SAFETY_KEYWORDS.iter().any(|k| content.contains(k))
}

pub fn safety_rules(passages: &[VectorCandidate]) -> Vec<SafetyRule> {
    passages
        .iter()
        .filter(|p| is_safety_passage(&p.content))
        .map(|p| SafetyRule {
            content: p.content.clone(),
            doc_id: p.doc_id.clone(),
            chunk_id: p.chunk_id.clone(),
        })
        .collect()
}

/// Whether `reference` names this passage's document by id, title or source path.
fn names_document(passage: &VectorCandidate, reference: &str) -> bool {
    let reference = reference.trim();
    passage.doc_id == reference
        || passage.metadata_str("source") == Some(reference)
        || passage
            .metadata_str("title")
            .is_some_and(|title| title.trim().eq_ignore_ascii_case(reference))
}

fn document_label(passage: &VectorCandidate) -> &str {
    passage.metadata_str("title").unwrap_or(&passage.doc_id)
}

/// Pairs where one passage's document declares it supersedes the other's.
pub fn detect_conflicts(passages: &[VectorCandidate]) -> Vec<PassageConflict> {
    let mut conflicts = Vec::new();

    for newer in passages {
        let Some(replaced) = newer.metadata_str("supersedes") else {
            continue;
        };
        for older in passages
            .iter()
            .filter(|p| p.doc_id != newer.doc_id && names_document(p, replaced))
        {
            conflicts.push(PassageConflict {
                current: newer.chunk_id.clone(),
                superseded: older.chunk_id.clone(),
                reason: format!(
                    "'{}' supersedes '{}'",
                    document_label(newer),
                    document_label(older)
                ),
            });
        }
    }

    conflicts
}

pub fn assemble(passages: Vec<VectorCandidate>, graph_facts: Vec<GraphFact>) -> EvidencePack {
    EvidencePack {
        citations: build_citations(&passages),
        safety_rules: safety_rules(&passages),
        conflicts: detect_conflicts(&passages),
        passages,
        graph_facts,
    }
}

pub fn mentions_bypass(raw_query: &str) -> bool {
    let query = raw_query.to_lowercase();
    BYPASS_KEYWORDS.iter().any(|k| query.contains(k))
}

/// Decide between synthesis, the fallback answer and a safety escalation.
pub fn sufficiency_gate(pack: Option<&EvidencePack>, raw_query: &str) -> GateRoute {
    let Some(pack) = pack else {
        return GateRoute::Insufficient;
    };

    if !pack.safety_rules.is_empty() && mentions_bypass(raw_query) {
        return GateRoute::SafetyCritical;
    }

    if pack.item_count() < 2 || pack.citations.is_empty() {
        return GateRoute::Insufficient;
    }

    GateRoute::Sufficient
}
