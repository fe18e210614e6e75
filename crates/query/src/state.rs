//! Per-run working state and the partial updates stages hand back to the orchestrator.

use extract::ExtractedEntity;
use index::{GraphPath, VectorCandidate};
use ingest::ClassificationLevel;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::intent::{Intent, IntentDecision};
use crate::memory::Exchange;

/// States of the retrieval state machine. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Normalize,
    Classify,
    Recall,
    Extract,
    Expand,
    Rerank,
    Assemble,
    Fuse,
    Synthesize,
    Cite,
    Guard,
    Insufficient,
    Escalate,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalize => "NORMALIZE",
            Stage::Classify => "CLASSIFY",
            Stage::Recall => "RECALL",
            Stage::Extract => "EXTRACT",
            Stage::Expand => "EXPAND",
            Stage::Rerank => "RERANK",
            Stage::Assemble => "ASSEMBLE",
            Stage::Fuse => "FUSE",
            Stage::Synthesize => "SYNTHESIZE",
            Stage::Cite => "CITE",
            Stage::Guard => "GUARD",
            Stage::Insufficient => "INSUFFICIENT",
            Stage::Escalate => "ESCALATE",
            Stage::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Insufficient | Stage::Escalate | Stage::Done)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user question. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub user_id: String,
    pub access_level: ClassificationLevel,
    pub session_id: String,
    pub trace_id: String,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: "anonymous".to_string(),
            access_level: ClassificationLevel::default(),
            session_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_access_level(mut self, level: ClassificationLevel) -> Self {
        self.access_level = level;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphFact {
    pub fact: String,
    pub source_nodes: Vec<String>,
    pub path: GraphPath,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_id: String,
    pub doc_title: Option<String>,
    pub section: Option<String>,
    pub page: Option<u64>,
    pub excerpt: String,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub content: String,
    pub doc_id: String,
    pub chunk_id: String,
}

/// Two passages that disagree. `superseded` is the older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageConflict {
    pub current: String,
    pub superseded: String,
    pub reason: String,
}

/// Evidence gathered on the way down. Read-only once assembled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidencePack {
    pub passages: Vec<VectorCandidate>,
    pub graph_facts: Vec<GraphFact>,
    pub safety_rules: Vec<SafetyRule>,
    pub citations: Vec<Citation>,
    pub conflicts: Vec<PassageConflict>,
}

impl EvidencePack {
    pub fn item_count(&self) -> usize {
        self.passages.len() + self.graph_facts.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEscalation {
    pub reason: String,
    pub severity: String,
    pub recommended_action: String,
    pub contact_roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusedSource {
    Vector,
    Graph,
    Rerank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedItem {
    pub content: String,
    /// Source score already scaled by the buffer weight.
    pub score: f32,
    pub source: FusedSource,
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

impl FusedItem {
    /// Label shown next to the item in the synthesis prompt.
    pub fn source_label(&self) -> &str {
        match &self.doc_id {
            Some(doc_id) => doc_id,
            None => self.nodes.first().map(String::as_str).unwrap_or("graph"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: f64,
}

/// What a stage produced. The orchestrator applies it to the state.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    Normalized(String),
    Classified(IntentDecision),
    Recalled { candidates: Vec<VectorCandidate>, skip: Vec<VectorCandidate> },
    Extracted(Vec<ExtractedEntity>),
    Expanded { facts: Vec<GraphFact>, skip: Vec<GraphFact> },
    Reranked { reranked: Vec<VectorCandidate>, skip: Vec<VectorCandidate> },
    Assembled(EvidencePack),
    Fused(Vec<FusedItem>),
    Synthesized { answer: String, confidence: f32 },
    Cited(Vec<Citation>),
    Guarded { answer: String },
    Insufficient { answer: String },
    Escalated { answer: String, escalation: SafetyEscalation },
}

/// Working set of one run, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub query: Query,
    /// Stage currently running, or the terminal reached.
    pub stage: Stage,
    pub history: Vec<Exchange>,
    pub normalized_query: String,
    pub intent: Option<IntentDecision>,

    pub vector_candidates: Vec<VectorCandidate>,
    pub entities: Vec<ExtractedEntity>,
    pub graph_facts: Vec<GraphFact>,
    pub reranked: Vec<VectorCandidate>,
    pub evidence_pack: Option<EvidencePack>,

    pub skip_vector: Vec<VectorCandidate>,
    pub skip_graph: Vec<GraphFact>,
    pub skip_rerank: Vec<VectorCandidate>,

    pub fused: Vec<FusedItem>,
    pub answer: String,
    pub confidence: f32,
    pub citations: Vec<Citation>,
    pub safety_escalation: Option<SafetyEscalation>,

    pub retries: u32,
    pub timings: Vec<StageTiming>,
}

impl PipelineState {
    pub fn new(query: Query, history: Vec<Exchange>) -> Self {
        Self {
            query,
            stage: Stage::Normalize,
            history,
            normalized_query: String::new(),
            intent: None,
            vector_candidates: Vec::new(),
            entities: Vec::new(),
            graph_facts: Vec::new(),
            reranked: Vec::new(),
            evidence_pack: None,
            skip_vector: Vec::new(),
            skip_graph: Vec::new(),
            skip_rerank: Vec::new(),
            fused: Vec::new(),
            answer: String::new(),
            confidence: 0.0,
            citations: Vec::new(),
            safety_escalation: None,
            retries: 0,
            timings: Vec::new(),
        }
    }

    pub fn intent(&self) -> Option<Intent> {
        self.intent.map(|d| d.intent)
    }

    pub fn apply(&mut self, update: StateUpdate) -> Result<()> {
        match update {
            StateUpdate::Normalized(normalized) => self.normalized_query = normalized,
            StateUpdate::Classified(decision) => {
                if self.intent.is_some() {
                    return Err(PipelineError::InvalidState("intent assigned twice".into()));
                }
                self.intent = Some(decision);
            }
            StateUpdate::Recalled { candidates, skip } => {
                self.vector_candidates = candidates;
                self.skip_vector = skip;
            }
            StateUpdate::Extracted(entities) => self.entities = entities,
            StateUpdate::Expanded { facts, skip } => {
                self.graph_facts = facts;
                self.skip_graph = skip;
            }
            StateUpdate::Reranked { reranked, skip } => {
                self.reranked = reranked;
                self.skip_rerank = skip;
            }
            StateUpdate::Assembled(pack) => self.evidence_pack = Some(pack),
            StateUpdate::Fused(items) => self.fused = items,
            StateUpdate::Synthesized { answer, confidence } => {
                self.answer = answer;
                self.confidence = confidence.clamp(0.0, 1.0);
            }
            StateUpdate::Cited(citations) => self.citations = citations,
            StateUpdate::Guarded { answer } => self.answer = answer,
            StateUpdate::Insufficient { answer } => {
                self.answer = answer;
                self.confidence = 0.0;
                self.citations.clear();
            }
            StateUpdate::Escalated { answer, escalation } => {
                // First escalation wins
                self.safety_escalation.get_or_insert(escalation);
                self.answer = answer;
                self.confidence = 0.0;
            }
        }
        Ok(())
    }

    pub fn record_timing(&mut self, stage: Stage, elapsed_ms: f64) {
        self.timings.push(StageTiming { stage, elapsed_ms });
    }
}

/// Counts and timings returned with every answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTrace {
    pub trace_id: String,
    pub session_id: String,
    pub terminal: Stage,
    pub retries: u32,
    pub normalized_query: String,
    pub vector_candidates: usize,
    pub entities: usize,
    pub graph_facts: usize,
    pub reranked: usize,
    pub fused: usize,
    pub timings: Vec<StageTiming>,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub answer: String,
    pub confidence: f32,
    pub citations: Vec<Citation>,
    pub intent: Option<Intent>,
    pub safety_escalation: Option<SafetyEscalation>,
    /// Superseded passages found in the evidence; empty when none were retrieved.
    pub conflicts: Vec<PassageConflict>,
    pub trace: PipelineTrace,
}
