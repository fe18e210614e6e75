//! The U-shaped retrieval run.
//!
//! Down path: normalize, classify, recall, extract, expand, rerank, assemble. Three skip
//! buffers are snapshotted on the way down (recall, expand, rerank) and fused on the way up
//! before synthesis, citation and guardrails.
//!
//! The run is a state machine over [`Stage`]. Each stage reads the state, returns a
//! [`StateUpdate`] and the orchestrator applies it and picks the next stage. The only cycle is
//! GUARD -> SYNTHESIZE, capped by `max_guard_retries`; an exhausted retry budget ends in
//! INSUFFICIENT.

use chrono::Utc;
use extract::{EntityNormalizer, Extractor, LanguageModel};
use index::{Embedder, FilterValue, GraphStore, VectorFilter, VectorStore};
use ingest::ClassificationLevel;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::evidence::{self, GateRoute};
use crate::expansion::GraphExpander;
use crate::fusion;
use crate::intent::{Intent, IntentClassifier};
use crate::memory::ConversationMemory;
use crate::rerank;
use crate::state::{
    PipelineOutput, PipelineState, PipelineTrace, Query, SafetyEscalation, Stage, StateUpdate,
};
use crate::synthesis::{self, GuardRoute, Synthesizer};

pub const INSUFFICIENT_ANSWER: &str = "I don't have enough information in the available documentation to \
answer this question accurately. Please try:
1. Rephrasing your question with more specific terms
2. Specifying the asset type or equipment name
3. Asking about a specific procedure or maintenance task

If this is urgent, please contact your maintenance supervisor or SME.";

pub const ESCALATION_ANSWER: &str = "**SAFETY NOTICE**

Your query involves potentially hazardous operations that require human expert review. \
This system cannot provide guidance for:
- Bypassing safety interlocks
- Overriding protective systems
- Shortcuts to standard procedures

Please contact your HSE representative or maintenance supervisor for guidance on this matter.";

pub fn hazardous_operation_escalation() -> SafetyEscalation {
    SafetyEscalation {
        reason: "Query involves potentially hazardous operations".to_string(),
        severity: "HIGH".to_string(),
        recommended_action: "Contact HSE representative".to_string(),
        contact_roles: vec![
            "HSE Representative".to_string(),
            "Maintenance Supervisor".to_string(),
        ],
    }
}

/// Document-type filter from the intent plus the caller's readable classifications.
pub fn recall_filter(intent: Option<Intent>, access_level: ClassificationLevel) -> VectorFilter {
    let mut filter = VectorFilter::new();

    if let Some(policy) = intent.map(|i| i.policy()) {
        if !policy.doc_types.is_empty() {
            let doc_types = policy.doc_types.iter().map(|t| t.as_str().to_string()).collect();
            filter.insert("doc_type".to_string(), FilterValue::AnyOf(doc_types));
        }
    }

    let readable = access_level.readable().iter().map(|l| l.as_str().to_string()).collect();
    filter.insert("classification".to_string(), FilterValue::AnyOf(readable));
    filter
}

/// Shared gateway handles, built once at startup.
#[derive(Clone)]
pub struct Gateways {
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub graph: Arc<dyn GraphStore>,
    pub llm: Arc<dyn LanguageModel>,
}

pub struct RetrievalPipeline {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    classifier: Arc<dyn IntentClassifier>,
    extractor: Extractor,
    expander: GraphExpander,
    synthesizer: Synthesizer,
    memory: Arc<ConversationMemory>,
    normalizer: EntityNormalizer,
    config: PipelineConfig,
}

impl RetrievalPipeline {
    pub fn new(
        gateways: Gateways,
        classifier: Arc<dyn IntentClassifier>,
        memory: Arc<ConversationMemory>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            embedder: gateways.embedder,
            vectors: gateways.vectors,
            classifier,
            extractor: Extractor::new(gateways.llm.clone()),
            expander: GraphExpander::new(gateways.graph),
            synthesizer: Synthesizer::new(gateways.llm),
            memory,
            normalizer: EntityNormalizer::new(),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub async fn run(&self, query: Query) -> Result<PipelineOutput> {
        self.run_with_cancel(query, CancellationToken::new()).await
    }

    /// Run to a terminal stage. Cancellation aborts with [`PipelineError::Cancelled`].
    pub async fn run_with_cancel(&self, query: Query, cancel: CancellationToken) -> Result<PipelineOutput> {
        let started = Instant::now();
        let state = self.execute(query, cancel).await?;

        self.memory
            .record(&state.query.session_id, &state.query.text, &state.answer);

        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            trace_id = %state.query.trace_id,
            terminal = %state.stage,
            confidence = state.confidence,
            retries = state.retries,
            total_ms,
            "Query answered"
        );

        Ok(into_output(state, total_ms))
    }

    /// Drive the state machine and hand back the final state.
    pub async fn execute(&self, query: Query, cancel: CancellationToken) -> Result<PipelineState> {
        let span = info_span!(
            "pipeline_run",
            trace_id = %query.trace_id,
            session_id = %query.session_id
        );

        self.drive(query, cancel).instrument(span).await
    }

    async fn drive(&self, query: Query, cancel: CancellationToken) -> Result<PipelineState> {
        let history = self.memory.recent(&query.session_id, 3);
        let mut state = PipelineState::new(query, history);

        loop {
            let stage = state.stage;
            let started = Instant::now();

            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(stage = %stage, "Run cancelled");
                    return Err(PipelineError::Cancelled);
                }
                result = tokio::time::timeout(self.config.gateway_timeout(), self.run_stage(stage, &state)) => {
                    match result {
                        Ok(update) => update?,
                        Err(_) => return Err(PipelineError::Timeout { stage }),
                    }
                }
            };

            if let Some(update) = update {
                state.apply(update)?;
            }
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            state.record_timing(stage, elapsed_ms);
            debug!(stage = %stage, elapsed_ms, "Stage finished");

            if stage.is_terminal() {
                return Ok(state);
            }
            state.stage = self.transition(&mut state);
        }
    }

    async fn run_stage(&self, stage: Stage, state: &PipelineState) -> Result<Option<StateUpdate>> {
        let config = &self.config;

        let update = match stage {
            Stage::Normalize => StateUpdate::Normalized(self.normalizer.normalize_query(&state.query.text)),

            Stage::Classify => {
                let decision = self.classifier.classify(&state.normalized_query).await;
                info!(intent = %decision.intent, confidence = decision.confidence, "Intent classified");
                StateUpdate::Classified(decision)
            }

            Stage::Recall => {
                let vector = self.embedder.embed_query(&state.normalized_query).await?;
                let filter = recall_filter(state.intent(), state.query.access_level);
                let candidates = self
                    .vectors
                    .search(&vector, config.recall_top_k, Some(&filter))
                    .await?;
                let skip = candidates.iter().take(config.skip_vector_size).cloned().collect();
                debug!(candidates = candidates.len(), "Vector recall finished");
                StateUpdate::Recalled { candidates, skip }
            }

            Stage::Extract => {
                // Raw text keeps asset tags upper case for the pattern fallback
                let mut context = format!("{}\n\n", state.query.text);
                for candidate in state.vector_candidates.iter().take(config.extraction_passages) {
                    context.extend(candidate.content.chars().take(config.extraction_passage_chars));
                    context.push_str("\n\n");
                }
                let entities = self.extractor.extract_entities(&context).await;
                debug!(entities = entities.len(), "Entities extracted");
                StateUpdate::Extracted(entities)
            }

            Stage::Expand => {
                let policy = state.intent().unwrap_or(Intent::Procedure).policy();
                let facts = self.expander.expand(&state.entities, policy, config).await;
                let skip = facts.iter().take(config.skip_graph_size).cloned().collect();
                StateUpdate::Expanded { facts, skip }
            }

            Stage::Rerank => {
                let reranked =
                    rerank::rerank(&state.vector_candidates, &state.graph_facts, config, Utc::now());
                let skip = reranked.iter().take(config.skip_rerank_size).cloned().collect();
                StateUpdate::Reranked { reranked, skip }
            }

            Stage::Assemble => {
                let pack = evidence::assemble(state.reranked.clone(), state.graph_facts.clone());
                debug!(
                    passages = pack.passages.len(),
                    facts = pack.graph_facts.len(),
                    safety_rules = pack.safety_rules.len(),
                    citations = pack.citations.len(),
                    conflicts = pack.conflicts.len(),
                    "Evidence assembled"
                );
                StateUpdate::Assembled(pack)
            }

            Stage::Fuse => StateUpdate::Fused(fusion::fuse(
                &state.skip_vector,
                &state.skip_graph,
                &state.skip_rerank,
                config.fusion,
                config.fused_top_k,
            )),

            Stage::Synthesize => {
                let conflicts = state
                    .evidence_pack
                    .as_ref()
                    .map(|pack| pack.conflicts.as_slice())
                    .unwrap_or_default();
                let (answer, confidence) = self
                    .synthesizer
                    .synthesize(
                        &state.query.text,
                        state.intent(),
                        &state.fused,
                        conflicts,
                        &state.history,
                        config,
                    )
                    .await?;
                StateUpdate::Synthesized { answer, confidence }
            }

            Stage::Cite => {
                let pack = state
                    .evidence_pack
                    .as_ref()
                    .ok_or_else(|| PipelineError::InvalidState("citation without evidence".into()))?;
                StateUpdate::Cited(pack.citations.clone())
            }

            Stage::Guard => StateUpdate::Guarded {
                answer: synthesis::apply_guardrails(&state.answer, state.evidence_pack.as_ref()),
            },

            Stage::Insufficient => StateUpdate::Insufficient { answer: INSUFFICIENT_ANSWER.to_string() },

            Stage::Escalate => StateUpdate::Escalated {
                answer: ESCALATION_ANSWER.to_string(),
                escalation: hazardous_operation_escalation(),
            },

            Stage::Done => return Ok(None),
        };

        Ok(Some(update))
    }

    /// Transition table. Only GUARD may loop back, and only `max_guard_retries` times.
    fn transition(&self, state: &mut PipelineState) -> Stage {
        match state.stage {
            Stage::Normalize => Stage::Classify,
            Stage::Classify => Stage::Recall,
            Stage::Recall => Stage::Extract,
            Stage::Extract => Stage::Expand,
            Stage::Expand => Stage::Rerank,
            Stage::Rerank => Stage::Assemble,
            Stage::Assemble => {
                let route = evidence::sufficiency_gate(state.evidence_pack.as_ref(), &state.query.text);
                info!(route = ?route, "Sufficiency gate");
                match route {
                    GateRoute::Sufficient => Stage::Fuse,
                    GateRoute::Insufficient => Stage::Insufficient,
                    GateRoute::SafetyCritical => Stage::Escalate,
                }
            }
            Stage::Fuse => Stage::Synthesize,
            Stage::Synthesize => Stage::Cite,
            Stage::Cite => Stage::Guard,
            Stage::Guard => {
                let route = synthesis::guard_route(
                    state.safety_escalation.is_some(),
                    state.confidence,
                    !state.citations.is_empty(),
                    self.config.confidence_floor,
                );
                match route {
                    GuardRoute::Pass => Stage::Done,
                    GuardRoute::Escalate => Stage::Escalate,
                    GuardRoute::Retry if state.retries < self.config.max_guard_retries => {
                        state.retries += 1;
                        info!(retry = state.retries, confidence = state.confidence, "Retrying synthesis");
                        Stage::Synthesize
                    }
                    GuardRoute::Retry => {
                        warn!(retries = state.retries, confidence = state.confidence, "Retry budget exhausted");
                        Stage::Insufficient
                    }
                }
            }
            terminal @ (Stage::Insufficient | Stage::Escalate | Stage::Done) => terminal,
        }
    }
}

fn into_output(state: PipelineState, total_ms: f64) -> PipelineOutput {
    let trace = PipelineTrace {
        trace_id: state.query.trace_id.clone(),
        session_id: state.query.session_id.clone(),
        terminal: state.stage,
        retries: state.retries,
        normalized_query: state.normalized_query.clone(),
        vector_candidates: state.vector_candidates.len(),
        entities: state.entities.len(),
        graph_facts: state.graph_facts.len(),
        reranked: state.reranked.len(),
        fused: state.fused.len(),
        timings: state.timings.clone(),
        total_ms,
    };

    PipelineOutput {
        answer: state.answer,
        confidence: state.confidence,
        citations: state.citations,
        intent: state.intent.map(|d| d.intent),
        safety_escalation: state.safety_escalation,
        conflicts: state.evidence_pack.map(|pack| pack.conflicts).unwrap_or_default(),
        trace,
    }
}
