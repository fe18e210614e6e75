//! Query intent and the fixed retrieval policy each intent implies.
//!
//! Two classifiers are provided. [`RuleBasedClassifier`] is a keyword table and is fully
//! deterministic. [`LlmIntentClassifier`] asks the language model at temperature 0 and falls
//! back to the rules whenever the model is unavailable or answers off-schema.

use async_trait::async_trait;
use extract::{ChatMessage, LanguageModel, RelationType};
use ingest::DocumentType;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Procedure,
    Troubleshooting,
    Definition,
    AssetInfo,
    Safety,
}

/// Recall filter and traversal policy for one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentPolicy {
    /// Empty means no document-type filter.
    pub doc_types: &'static [DocumentType],
    pub edge_types: &'static [RelationType],
    pub max_hops: usize,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Procedure,
        Intent::Troubleshooting,
        Intent::Definition,
        Intent::AssetInfo,
        Intent::Safety,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Procedure => "PROCEDURE",
            Intent::Troubleshooting => "TROUBLESHOOTING",
            Intent::Definition => "DEFINITION",
            Intent::AssetInfo => "ASSET_INFO",
            Intent::Safety => "SAFETY",
        }
    }

    pub fn policy(&self) -> IntentPolicy {
        use DocumentType::*;
        use RelationType::*;

        match self {
            Intent::Procedure => IntentPolicy {
                doc_types: &[Sop, OemManual, Checklist],
                edge_types: &[HasProcedure, HasStep, AppliesTo, RequiresTool],
                max_hops: 2,
            },
            Intent::Troubleshooting => IntentPolicy {
                doc_types: &[OemManual, Rca, Bulletin],
                edge_types: &[Indicates, CausedBy, Affects, Mitigates],
                max_hops: 3,
            },
            Intent::Definition => IntentPolicy {
                doc_types: &[Standard, OemManual],
                edge_types: &[DefinedAs, SynonymOf, IsA, PartOf],
                max_hops: 2,
            },
            Intent::AssetInfo => IntentPolicy {
                doc_types: &[],
                edge_types: &[HasSubsystem, HasComponent, InstalledAt, MadeBy],
                max_hops: 2,
            },
            Intent::Safety => IntentPolicy {
                doc_types: &[Sop, Standard],
                edge_types: &[HasSafetyRule, Mitigates, Requires],
                max_hops: 2,
            },
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "PROCEDURE" => Ok(Intent::Procedure),
            "TROUBLESHOOTING" => Ok(Intent::Troubleshooting),
            "DEFINITION" => Ok(Intent::Definition),
            "ASSET_INFO" => Ok(Intent::AssetInfo),
            "SAFETY" => Ok(Intent::Safety),
            other => Err(format!("unknown intent: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntentDecision {
    pub intent: Intent,
    pub confidence: f32,
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Classify an already normalized query.
    async fn classify(&self, normalized_query: &str) -> IntentDecision;
}

const TROUBLESHOOTING_KEYWORDS: &[&str] = &[
    "troubleshoot",
    "diagnose",
    "problem",
    "issue",
    "failure",
    "not working",
    "vibration",
    "noise",
    "leak",
    "overheating",
    "alarm",
    "fault",
    "error",
];

const DEFINITION_KEYWORDS: &[&str] =
    &["what is", "what are", "define", "meaning of", "explain", "definition"];

const ASSET_KEYWORDS: &[&str] = &[
    "specification",
    "specs",
    "rating",
    "capacity",
    "model",
    "manufacturer",
    "serial",
    "installed",
    "location",
];

// Normalization has already expanded "ppe" and "loto".
const SAFETY_KEYWORDS: &[&str] = &[
    "safety",
    "hazard",
    "ppe",
    "protective equipment",
    "lockout",
    "tagout",
    "permit",
    "risk",
    "danger",
];

/// Keyword rules. Later groups override earlier ones, so SAFETY wins over everything.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedClassifier;

impl RuleBasedClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify_text(&self, normalized_query: &str) -> IntentDecision {
        let query = normalized_query.to_lowercase();
        let hit = |keywords: &[&str]| keywords.iter().any(|k| query.contains(k));

        let rules = [
            (TROUBLESHOOTING_KEYWORDS, Intent::Troubleshooting),
            (DEFINITION_KEYWORDS, Intent::Definition),
            (ASSET_KEYWORDS, Intent::AssetInfo),
            (SAFETY_KEYWORDS, Intent::Safety),
        ];

        let matched = rules.iter().rev().find(|(keywords, _)| hit(keywords));
        match matched {
            Some((_, intent)) => IntentDecision { intent: *intent, confidence: 0.8 },
            None => IntentDecision { intent: Intent::Procedure, confidence: 0.5 },
        }
    }
}

#[async_trait]
impl IntentClassifier for RuleBasedClassifier {
    async fn classify(&self, normalized_query: &str) -> IntentDecision {
        self.classify_text(normalized_query)
    }
}

const CLASSIFIER_PROMPT: &str = r#"You are an intent classifier for an oil & gas maintenance knowledge base.

Classify the query into exactly one intent:
- PROCEDURE: how-to questions and step-by-step instructions
- TROUBLESHOOTING: problem diagnosis and failure analysis
- DEFINITION: meaning of a term, abbreviation or concept
- ASSET_INFO: equipment specifications, location, manufacturer
- SAFETY: PPE, hazards, permits and safety procedures

Respond with JSON: {"intent": "...", "confidence": 0.0-1.0, "reasoning": "brief explanation"}"#;

#[derive(Deserialize)]
struct Classification {
    intent: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

fn default_confidence() -> f32 {
    0.8
}

/// Model-backed classifier. Deterministic as long as the model is at temperature 0.
pub struct LlmIntentClassifier {
    llm: Arc<dyn LanguageModel>,
    fallback: RuleBasedClassifier,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm, fallback: RuleBasedClassifier::new() }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, normalized_query: &str) -> IntentDecision {
        let schema = json!({
            "type": "object",
            "required": ["intent"],
            "properties": {
                "intent": { "type": "string" },
                "confidence": { "type": "number" },
                "reasoning": { "type": "string" }
            }
        });
        let messages = [
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(format!("Classify this query:\n\n{}", normalized_query)),
        ];

        let parsed = extract::llm::complete_as::<Classification>(self.llm.as_ref(), &messages, &schema, 0.0)
            .await
            .map_err(|e| e.to_string())
            .and_then(|c| Ok((c.intent.parse::<Intent>()?, c.confidence, c.reasoning)));

        match parsed {
            Ok((intent, confidence, reasoning)) => {
                debug!(%intent, confidence, reasoning = %reasoning, "Model classified intent");
                IntentDecision { intent, confidence: confidence.clamp(0.0, 1.0) }
            }
            Err(problem) => {
                warn!(problem = %problem, "Intent classification failed, using keyword rules");
                self.fallback.classify_text(normalized_query)
            }
        }
    }
}
