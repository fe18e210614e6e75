pub mod config;
pub mod error;
pub mod evidence;
pub mod expansion;
pub mod fusion;
pub mod intent;
pub mod memory;
pub mod pipeline;
pub mod rerank;
pub mod state;
pub mod synthesis;

pub use config::{FusionWeights, PipelineConfig, RerankWeights};
pub use error::PipelineError;
pub use evidence::GateRoute;
pub use intent::{Intent, IntentClassifier, IntentDecision, LlmIntentClassifier, RuleBasedClassifier};
pub use memory::{ConversationMemory, Exchange};
pub use pipeline::{Gateways, RetrievalPipeline};
pub use state::{
    Citation, EvidencePack, GraphFact, PipelineOutput, PipelineState, PipelineTrace, Query,
    SafetyEscalation, Stage,
};
pub use synthesis::GuardRoute;
