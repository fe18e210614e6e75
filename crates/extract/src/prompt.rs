use serde_json::{Value, json};

use crate::llm::ChatMessage;
use crate::schema::EntityType;

/// Upper bound on characters sent for query-time extraction.
pub const QUERY_CONTEXT_CHARS: usize = 2000;

fn entity_type_list() -> String {
    EntityType::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
}

/// JSON schema for [`crate::schema::ExtractionOutput`].
pub fn extraction_schema() -> Value {
    let types: Vec<&str> = EntityType::ALL.iter().map(|t| t.as_str()).collect();

    json!({
        "type": "object",
        "required": ["entities"],
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["name", "type", "confidence"],
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string", "enum": types},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "context": {"type": "string"}
                    }
                }
            },
            "relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["subject", "predicate", "object"],
                    "properties": {
                        "subject": {"type": "string"},
                        "predicate": {"type": "string"},
                        "object": {"type": "string"},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                    }
                }
            }
        }
    })
}

/// Messages for ingestion-time extraction of entities and relations from one chunk.
pub fn build_extraction_messages(chunk_text: &str) -> Vec<ChatMessage> {
    let system = format!(
        r#"You extract a maintenance knowledge graph from industrial documents.

RULES:
- Entity types must be one of: {}
- Use asset tags exactly as written (e.g. P-101A, V-201)
- Relation predicates are UPPER_SNAKE_CASE, for example APPLIES_TO, REQUIRES, REQUIRES_TOOL,
  INDICATES, CAUSED_BY, AFFECTS, MITIGATES, PART_OF, LOCATED_AT, INSTALLED_AT, MADE_BY,
  HAS_PROCEDURE, HAS_STEP, HAS_COMPONENT, HAS_SUBSYSTEM, HAS_SAFETY_RULE, DEFINED_AS, IS_A
- Relation subject and object must be names of extracted entities
- confidence is between 0 and 1
- context is the short phrase the entity appears in"#,
        entity_type_list()
    );

    vec![ChatMessage::system(system), ChatMessage::user(chunk_text.to_string())]
}

/// Messages for query-time extraction over the query and the leading passages.
pub fn build_query_extraction_messages(context: &str) -> Vec<ChatMessage> {
    let system = format!(
        "Extract entities from the text. Return JSON with an entities array. \
         Each entity has: name, type ({}), confidence (0-1).",
        entity_type_list()
    );
    let bounded: String = context.chars().take(QUERY_CONTEXT_CHARS).collect();

    vec![ChatMessage::system(system), ChatMessage::user(bounded)]
}

/// Follow-up turn asking the model to repair output that failed validation.
pub fn build_retry_messages(
    original: &[ChatMessage],
    problem: &str,
) -> Vec<ChatMessage> {
    let mut messages = original.to_vec();
    messages.push(ChatMessage::user(format!(
        "Your previous answer was rejected: {}\n\nReturn the corrected JSON object only, \
         with no markdown formatting, no code blocks and no explanations.",
        problem
    )));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_extraction_is_bounded() {
        let long = "x".repeat(QUERY_CONTEXT_CHARS * 2);
        let messages = build_query_extraction_messages(&long);
        assert_eq!(messages[1].content.chars().count(), QUERY_CONTEXT_CHARS);
        assert!(messages[0].content.contains("SAFETY_RULE"));
    }

    #[test]
    fn test_schema_lists_every_entity_type() {
        let schema = extraction_schema();
        let types = schema["properties"]["entities"]["items"]["properties"]["type"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(types.len(), EntityType::ALL.len());
        assert_eq!(schema["required"][0], "entities");
    }

    #[test]
    fn test_retry_messages_append_problem() {
        let original = build_extraction_messages("Pump P-101 requires a torque wrench.");
        let retry = build_retry_messages(&original, "missing required field `entities`");
        assert_eq!(retry.len(), original.len() + 1);
        assert!(retry.last().unwrap().content.contains("missing required field"));
    }
}
