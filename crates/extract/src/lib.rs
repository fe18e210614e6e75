pub mod llm;
pub mod normalizer;
pub mod ollama;
pub mod openai_compat;
pub mod prompt;
pub mod retry;
pub mod schema;

pub use llm::{ChatMessage, LanguageModel, LlmConfig, LlmError, LlmProvider, ProviderKind, Role};
pub use normalizer::EntityNormalizer;
pub use retry::{RetryPolicy, RetryableError};
pub use schema::{
    EntityType, ExtractedChunk, ExtractedEntity, ExtractedRelation, ExtractionOutput, RelationType,
};

use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static ASSET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{1,3}-\d{2,4}[A-Z]?\b").expect("valid asset pattern"));

/// Confidence assigned to asset tags found by the pattern fallback.
pub const PATTERN_CONFIDENCE: f32 = 0.9;

/// Deterministic fallback: asset tags in `text`, first occurrence only.
pub fn pattern_entities(text: &str) -> Vec<ExtractedEntity> {
    let mut seen = HashSet::new();
    ASSET_PATTERN
        .find_iter(text)
        .filter(|m| seen.insert(m.as_str().to_string()))
        .map(|m| ExtractedEntity::new(m.as_str(), EntityType::Asset, PATTERN_CONFIDENCE))
        .collect()
}

pub struct Extractor {
    llm: Arc<dyn LanguageModel>,
}

impl Extractor {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Structured extraction with one repair turn when the output fails validation.
    async fn structured(&self, messages: Vec<ChatMessage>) -> Result<ExtractionOutput, LlmError> {
        let schema = prompt::extraction_schema();

        match llm::complete_as::<ExtractionOutput>(self.llm.as_ref(), &messages, &schema, 0.0).await {
            Err(LlmError::Schema(problem)) => {
                debug!(problem = %problem, "Extraction output rejected, asking for a repair");
                let retry = prompt::build_retry_messages(&messages, &problem);
                llm::complete_as::<ExtractionOutput>(self.llm.as_ref(), &retry, &schema, 0.0).await
            }
            other => other,
        }
    }

    /// Ingestion-time extraction of entities and relations from one chunk.
    ///
    /// Malformed output falls back to pattern extraction; transport failures are returned.
    pub async fn extract_chunk(
        &self,
        chunk_id: &str,
        doc_id: &str,
        text: &str,
    ) -> Result<ExtractedChunk, LlmError> {
        let mut extraction = match self.structured(prompt::build_extraction_messages(text)).await {
            Ok(output) => clean_extraction(output, text),
            Err(LlmError::Schema(problem)) => {
                warn!(chunk_id, problem = %problem, "Falling back to pattern extraction");
                ExtractionOutput { entities: pattern_entities(text), relations: Vec::new() }
            }
            Err(e) => return Err(e),
        };

        for entity in &mut extraction.entities {
            entity.source_chunk_id = Some(chunk_id.to_string());
        }

        Ok(ExtractedChunk {
            chunk_id: chunk_id.to_string(),
            doc_id: doc_id.to_string(),
            extraction,
        })
    }

    /// Query-time extraction. Any gateway failure degrades to pattern extraction.
    pub async fn extract_entities(&self, context: &str) -> Vec<ExtractedEntity> {
        match self.structured(prompt::build_query_extraction_messages(context)).await {
            Ok(output) => clean_extraction(output, context).entities,
            Err(e) => {
                warn!(error = %e, "Entity extraction failed, using asset tag patterns");
                pattern_entities(context)
            }
        }
    }
}

/// Drop blank or duplicate entities and relations whose endpoints were not extracted.
fn clean_extraction(output: ExtractionOutput, text: &str) -> ExtractionOutput {
    let mut seen = HashSet::new();
    let entities: Vec<ExtractedEntity> = output
        .entities
        .into_iter()
        .filter(|e| !e.name.trim().is_empty())
        .filter(|e| seen.insert((e.name.to_lowercase(), e.entity_type)))
        .map(|mut e| {
            e.confidence = e.confidence.clamp(0.0, 1.0);
            e
        })
        .collect();

    let names: HashSet<String> = entities.iter().map(|e| e.name.to_lowercase()).collect();
    let relations = output
        .relations
        .into_iter()
        .filter(|r| names.contains(&r.subject.to_lowercase()) && names.contains(&r.object.to_lowercase()))
        .map(|mut r| {
            if r.predicate == RelationType::Unknown {
                r.predicate = RelationType::RelatedTo;
            }
            r.confidence = r.confidence.clamp(0.0, 1.0);
            r
        })
        .collect();

    if entities.is_empty() {
        debug!(chars = text.len(), "Model returned no entities");
    }

    ExtractionOutput { entities, relations }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::Mutex;

    /// Replays canned structured responses in order.
    struct ScriptedModel {
        responses: Mutex<Vec<Result<serde_json::Value, LlmError>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<serde_json::Value, LlmError>>) -> Self {
            Self { responses: Mutex::new(responses) }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        fn supports_structured_output(&self) -> bool {
            true
        }

        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: Option<u32>,
        ) -> Result<String, LlmError> {
            Err(LlmError::Unsupported { provider: "scripted", capability: "complete" })
        }

        async fn complete_structured(
            &self,
            _messages: &[ChatMessage],
            _schema: &serde_json::Value,
            _temperature: f32,
        ) -> Result<serde_json::Value, LlmError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(LlmError::EmptyResponse);
            }
            responses.remove(0)
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
            Err(LlmError::Unsupported { provider: "scripted", capability: "stream" })
        }
    }

    #[test]
    fn test_pattern_entities_finds_unique_asset_tags() {
        let entities = pattern_entities("Isolate V-201 before opening P-101A. Recheck V-201.");
        let names: Vec<&str> = entities.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["V-201", "P-101A"]);
        assert!(entities.iter().all(|e| e.entity_type == EntityType::Asset));
        assert!(entities.iter().all(|e| e.confidence == PATTERN_CONFIDENCE));
    }

    #[tokio::test]
    async fn test_extract_chunk_repairs_once() {
        let model = ScriptedModel::new(vec![
            Err(LlmError::Schema("missing required field `entities`".into())),
            Ok(serde_json::json!({
                "entities": [
                    {"name": "P-101", "type": "ASSET", "confidence": 0.95},
                    {"name": "mechanical seal", "type": "COMPONENT", "confidence": 0.8}
                ],
                "relations": [
                    {"subject": "P-101", "predicate": "HAS_COMPONENT", "object": "mechanical seal"},
                    {"subject": "P-101", "predicate": "HAS_COMPONENT", "object": "impeller"}
                ]
            })),
        ]);
        let extractor = Extractor::new(Arc::new(model));

        let chunk = extractor.extract_chunk("c1", "d1", "P-101 mechanical seal").await.unwrap();

        assert_eq!(chunk.extraction.entities.len(), 2);
        assert_eq!(chunk.extraction.relations.len(), 1);
        assert_eq!(chunk.extraction.entities[0].source_chunk_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_schema_failures_fall_back_to_patterns() {
        let model = ScriptedModel::new(vec![
            Err(LlmError::Schema("bad".into())),
            Err(LlmError::Schema("still bad".into())),
        ]);
        let extractor = Extractor::new(Arc::new(model));

        let chunk = extractor.extract_chunk("c1", "d1", "Pump P-101 tripped").await.unwrap();

        assert_eq!(chunk.extraction.entities.len(), 1);
        assert_eq!(chunk.extraction.entities[0].name, "P-101");
    }

    #[tokio::test]
    async fn test_transport_errors_surface_at_ingestion() {
        let model = ScriptedModel::new(vec![Err(LlmError::Status { status: 503, body: String::new() })]);
        let extractor = Extractor::new(Arc::new(model));

        let result = extractor.extract_chunk("c1", "d1", "P-101").await;
        assert!(matches!(result, Err(LlmError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_query_extraction_never_fails() {
        let model = ScriptedModel::new(vec![Err(LlmError::EmptyResponse)]);
        let extractor = Extractor::new(Arc::new(model));

        let entities = extractor.extract_entities("what ppe is required for valve V-201?").await;
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "V-201");
    }
}
