//! Language model gateway.
//!
//! [`LanguageModel`] is the capability every provider offers. The set of providers is
//! closed ([`LlmProvider`]) and picked once at startup from [`LlmConfig`]; callers hold an
//! `Arc<dyn LanguageModel>` and never construct clients themselves.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::ollama::OllamaClient;
use crate::openai_compat::OpenAiCompatibleClient;
use crate::retry::{RetryPolicy, RetryableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("structured output did not match schema: {0}")]
    Schema(String),

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },

    #[error("provider returned an empty completion")]
    EmptyResponse,
}

impl RetryableError for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Schema(_) | LlmError::Unsupported { .. } | LlmError::EmptyResponse => false,
        }
    }
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        RetryableError::is_transient(self)
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider_name(&self) -> &'static str;

    fn supports_structured_output(&self) -> bool;

    /// Free-text completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError>;

    /// JSON completion whose top-level `required` keys are checked against `schema`.
    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
        temperature: f32,
    ) -> Result<serde_json::Value, LlmError>;

    /// Token stream of a free-text completion.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError>;
}

/// Structured completion decoded straight into `T`.
pub async fn complete_as<T: DeserializeOwned>(
    llm: &dyn LanguageModel,
    messages: &[ChatMessage],
    schema: &serde_json::Value,
    temperature: f32,
) -> Result<T, LlmError> {
    let value = llm.complete_structured(messages, schema, temperature).await?;
    serde_json::from_value(value).map_err(|e| LlmError::Schema(e.to_string()))
}

/// Parse a raw completion as JSON and check the schema's top-level `required` keys.
pub fn parse_structured(raw: &str, schema: &serde_json::Value) -> Result<serde_json::Value, LlmError> {
    let cleaned = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: serde_json::Value =
        serde_json::from_str(cleaned).map_err(|e| LlmError::Schema(e.to_string()))?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let object = value
            .as_object()
            .ok_or_else(|| LlmError::Schema("expected a JSON object".to_string()))?;
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(LlmError::Schema(format!("missing required field `{}`", key)));
            }
        }
    }

    Ok(value)
}

/// Schema instruction appended to the system prompt for providers without a native JSON mode.
pub fn schema_instruction(schema: &serde_json::Value) -> String {
    format!(
        "Respond with valid JSON matching this schema:\n{}\n\nOutput ONLY the JSON object, no markdown or explanation.",
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
    )
}

/// Add the schema instruction to the first system message, or prepend one.
pub fn with_schema_instruction(messages: &[ChatMessage], schema: &serde_json::Value) -> Vec<ChatMessage> {
    let instruction = schema_instruction(schema);
    let mut enhanced = messages.to_vec();

    match enhanced.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            system.content.push_str("\n\n");
            system.content.push_str(&instruction);
        }
        None => enhanced.insert(0, ChatMessage::system(instruction)),
    }

    enhanced
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    OpenaiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The closed set of language model providers.
pub enum LlmProvider {
    Ollama(OllamaClient),
    OpenAiCompatible(OpenAiCompatibleClient),
}

impl LlmProvider {
    pub fn from_config(config: &LlmConfig, retry: RetryPolicy) -> Result<Self, LlmError> {
        Ok(match config.provider {
            ProviderKind::Ollama => LlmProvider::Ollama(OllamaClient::new(config, retry)?),
            ProviderKind::OpenaiCompatible => {
                LlmProvider::OpenAiCompatible(OpenAiCompatibleClient::new(config, retry)?)
            }
        })
    }

    fn inner(&self) -> &dyn LanguageModel {
        match self {
            LlmProvider::Ollama(client) => client,
            LlmProvider::OpenAiCompatible(client) => client,
        }
    }
}

#[async_trait]
impl LanguageModel for LlmProvider {
    fn provider_name(&self) -> &'static str {
        self.inner().provider_name()
    }

    fn supports_structured_output(&self) -> bool {
        self.inner().supports_structured_output()
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        self.inner().complete(messages, temperature, max_tokens).await
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
        temperature: f32,
    ) -> Result<serde_json::Value, LlmError> {
        self.inner().complete_structured(messages, schema, temperature).await
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        self.inner().stream(messages, temperature).await
    }
}

/// Split complete `\n`-terminated lines off the front of a byte buffer.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if !text.is_empty() {
            lines.push(text);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_structured_checks_required_fields() {
        let schema = json!({"type": "object", "required": ["entities"]});

        assert!(parse_structured(r#"{"entities": []}"#, &schema).is_ok());
        assert!(matches!(
            parse_structured(r#"{"items": []}"#, &schema),
            Err(LlmError::Schema(_))
        ));
        assert!(matches!(parse_structured("not json", &schema), Err(LlmError::Schema(_))));
    }

    #[test]
    fn test_parse_structured_strips_code_fences() {
        let schema = json!({"required": ["intent"]});
        let value = parse_structured("```json\n{\"intent\": \"safety\"}\n```", &schema).unwrap();
        assert_eq!(value["intent"], "safety");
    }

    #[test]
    fn test_schema_instruction_joins_existing_system_prompt() {
        let schema = json!({"required": ["a"]});
        let messages = vec![ChatMessage::system("Extract."), ChatMessage::user("text")];
        let enhanced = with_schema_instruction(&messages, &schema);

        assert_eq!(enhanced.len(), 2);
        assert!(enhanced[0].content.starts_with("Extract."));
        assert!(enhanced[0].content.contains("valid JSON"));

        let bare = with_schema_instruction(&[ChatMessage::user("text")], &schema);
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[0].role, Role::System);
    }

    #[test]
    fn test_status_errors_classify_transience() {
        let throttled = LlmError::Status { status: 429, body: String::new() };
        let bad_request = LlmError::Status { status: 400, body: String::new() };
        assert!(throttled.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!LlmError::Schema("x".into()).is_transient());
    }

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut buffer = b"{\"a\":1}\n{\"b\":2}\n{\"c\"".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buffer, b"{\"c\"".to_vec());
    }
}
