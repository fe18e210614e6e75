use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::llm::{
    ChatMessage, LanguageModel, LlmConfig, LlmError, drain_lines, parse_structured,
    with_schema_instruction,
};
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>, // "json" for structured output
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig, retry: RetryPolicy) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
            retry,
        })
    }

    async fn post_chat(&self, request: &OllamaChatRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.base_url);

        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        Ok(response)
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
        format: Option<&'static str>,
    ) -> Result<String, LlmError> {
        let request = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            format,
            options: OllamaOptions { temperature, num_predict: max_tokens },
        };

        let content = self
            .retry
            .retry("ollama_chat", || async {
                let response = self.post_chat(&request).await?;
                let parsed: OllamaChatResponse = response.json().await?;
                Ok::<_, LlmError>(parsed.message.content)
            })
            .await?;

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn provider_name(&self) -> &'static str {
        "ollama"
    }

    fn supports_structured_output(&self) -> bool {
        true // via JSON mode
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        self.chat(messages, temperature, max_tokens, None).await
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
        temperature: f32,
    ) -> Result<serde_json::Value, LlmError> {
        let enhanced = with_schema_instruction(messages, schema);
        let raw = self.chat(&enhanced, temperature, None, Some("json")).await?;
        parse_structured(&raw, schema)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let request = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: true,
            format: None,
            options: OllamaOptions { temperature, num_predict: None },
        };
        let response = self.post_chat(&request).await?;

        Ok(Box::pin(ndjson_tokens(response.bytes_stream())))
    }
}

/// Ollama streams newline-delimited JSON objects, the last one flagged `done`.
fn ndjson_tokens<S, B>(bytes: S) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer = Vec::new();
        'outer: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(LlmError::from)?;
            buffer.extend_from_slice(chunk.as_ref());
            for line in drain_lines(&mut buffer) {
                let part: OllamaChatResponse = serde_json::from_str(&line)
                    .map_err(|e| LlmError::Schema(e.to_string()))?;
                if !part.message.content.is_empty() {
                    yield part.message.content;
                }
                if part.done {
                    break 'outer;
                }
            }
        }
    }
}
