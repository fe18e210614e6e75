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

/// Client for any server speaking the OpenAI chat-completions dialect (vLLM, llama.cpp, LM Studio).
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &LlmConfig, retry: RetryPolicy) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            client,
            retry,
        })
    }

    async fn post(&self, request: &ChatCompletionRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;

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
        json_mode: bool,
    ) -> Result<String, LlmError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            stream: false,
            max_tokens,
            response_format: json_mode.then(|| serde_json::json!({"type": "json_object"})),
        };

        let content = self
            .retry
            .retry("openai_chat", || async {
                let response = self.post(&request).await?;
                let parsed: ChatCompletionResponse = response.json().await?;
                Ok::<_, LlmError>(
                    parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message)
                        .and_then(|m| m.content)
                        .unwrap_or_default(),
                )
            })
            .await?;

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        Ok(content)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleClient {
    fn provider_name(&self) -> &'static str {
        "openai_compatible"
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        self.chat(messages, temperature, max_tokens, false).await
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
        temperature: f32,
    ) -> Result<serde_json::Value, LlmError> {
        let enhanced = with_schema_instruction(messages, schema);
        let raw = self.chat(&enhanced, temperature, None, true).await?;
        parse_structured(&raw, schema)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            stream: true,
            max_tokens: None,
            response_format: None,
        };
        let response = self.post(&request).await?;

        Ok(Box::pin(sse_tokens(response.bytes_stream())))
    }
}

/// Server-sent events: `data: {json}` lines, terminated by `data: [DONE]`.
fn sse_tokens<S, B>(bytes: S) -> impl Stream<Item = Result<String, LlmError>> + Send + 'static
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
                let Some(data) = sse_data(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }
                let part: ChatCompletionResponse = serde_json::from_str(data)
                    .map_err(|e| LlmError::Schema(e.to_string()))?;
                let token = part
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content)
                    .unwrap_or_default();
                if !token.is_empty() {
                    yield token;
                }
            }
        }
    }
}

fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}
