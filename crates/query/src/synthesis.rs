//! Up-path answer generation and the checks applied to the generated text.

use extract::{ChatMessage, LanguageModel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::intent::Intent;
use crate::memory::Exchange;
use crate::state::{EvidencePack, FusedItem, PassageConflict};

const SYSTEM_PROMPT: &str = "You are a maintenance assistant for oil & gas operations.
Generate a response based ONLY on the provided evidence.

RULES:
1. Only state facts that appear in the evidence
2. Cite every claim with [source number]
3. If evidence is insufficient, say \"I don't have enough information\"
4. Include all relevant safety warnings from evidence
5. For procedures, provide step-by-step guidance matching the source
6. Where CONFLICTS are listed, answer from the current document and say it replaces the older one

INTENT: ";

const HEDGING_PHRASES: &[&str] = &[
    "i think",
    "probably",
    "might be",
    "i assume",
    "generally speaking",
    "in my experience",
];

pub const VERIFY_DISCLAIMER: &str =
    "\n\n*Note: Please verify this information with official documentation.*";

pub const SAFETY_REMINDER: &str = "\n\n**Safety Reminder**: Always follow proper safety procedures \
     and use required PPE when performing maintenance tasks.";

/// Numbered `[i] Source: <label>` block of the first `limit` fused items.
pub fn evidence_block(fused: &[FusedItem], limit: usize) -> String {
    fused
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, item)| format!("[{}] Source: {}\n{}\n\n", i + 1, item.source_label(), item.content))
        .collect()
}

/// Superseded documents the model must not follow, one line per conflict.
pub fn conflict_notes(conflicts: &[PassageConflict]) -> String {
    if conflicts.is_empty() {
        return String::new();
    }

    let lines: String = conflicts
        .iter()
        .map(|c| format!("- {}; follow the current document\n", c.reason))
        .collect();
    format!("CONFLICTS:\n{}", lines)
}

pub fn build_messages(
    query: &str,
    intent: Option<Intent>,
    fused: &[FusedItem],
    conflicts: &[PassageConflict],
    history: &[Exchange],
    block_size: usize,
) -> Vec<ChatMessage> {
    let intent = intent.map(|i| i.as_str()).unwrap_or("general");
    let mut messages = vec![ChatMessage::system(format!("{}{}", SYSTEM_PROMPT, intent))];

    for exchange in history {
        messages.push(ChatMessage::user(exchange.query.clone()));
        messages.push(ChatMessage::assistant(exchange.answer.clone()));
    }

    messages.push(ChatMessage::user(format!(
        "QUERY: {}\n\nEVIDENCE:\n{}{}",
        query,
        evidence_block(fused, block_size),
        conflict_notes(conflicts)
    )));
    messages
}

/// Conservative heuristic: 0.1 per evidence item given to the model, at most 0.95.
pub fn estimate_confidence(items_used: usize) -> f32 {
    (items_used as f32 / 10.0).min(0.95)
}

pub struct Synthesizer {
    llm: Arc<dyn LanguageModel>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    pub async fn synthesize(
        &self,
        query: &str,
        intent: Option<Intent>,
        fused: &[FusedItem],
        conflicts: &[PassageConflict],
        history: &[Exchange],
        config: &PipelineConfig,
    ) -> Result<(String, f32)> {
        let messages =
            build_messages(query, intent, fused, conflicts, history, config.evidence_block_size);
        let answer = self
            .llm
            .complete(&messages, config.synthesis_temperature, config.synthesis_max_tokens)
            .await?;

        let used = fused.len().min(config.evidence_block_size);
        debug!(provider = self.llm.provider_name(), items = used, chars = answer.len(), "Answer synthesized");
        Ok((answer, estimate_confidence(used)))
    }
}

/// Append the disclaimer and safety reminder where needed. Never touches confidence or citations.
pub fn apply_guardrails(answer: &str, pack: Option<&EvidencePack>) -> String {
    let lower = answer.to_lowercase();
    let mut guarded = answer.to_string();

    if HEDGING_PHRASES.iter().any(|p| lower.contains(p)) {
        guarded.push_str(VERIFY_DISCLAIMER);
    }

    let has_safety_evidence = pack.is_some_and(|p| !p.safety_rules.is_empty());
    let mentions_safety = ["safety", "warning", "caution"].iter().any(|w| lower.contains(w));
    if has_safety_evidence && !mentions_safety {
        guarded.push_str(SAFETY_REMINDER);
    }

    guarded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardRoute {
    Pass,
    Escalate,
    Retry,
}

pub fn guard_route(escalated: bool, confidence: f32, has_citations: bool, floor: f32) -> GuardRoute {
    if escalated {
        GuardRoute::Escalate
    } else if confidence < floor || !has_citations {
        GuardRoute::Retry
    } else {
        GuardRoute::Pass
    }
}
