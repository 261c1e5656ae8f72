//! HTTP gateway client
//!
//! Talks to the OpenAI-compatible model gateway proxy. Non-streaming calls
//! use the regular client; `stream_text` parses the SSE response line by
//! line, yielding deltas as they arrive and the aggregate usage at the end.

use async_stream::try_stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    GenerateRequest, ModelGateway, ModelRole, ObjectResponse, StreamChunk, TextResponse,
    TextStream, TokenUsage, INTERNAL_SECRET_HEADER, TRACE_ID_HEADER,
};
use crate::error::{Error, Result};
use crate::http_client;

/// Model ids per logical role
#[derive(Debug, Clone)]
pub struct RoleModels {
    pub planner: String,
    pub summarizer: String,
    pub answerer: String,
    pub utility: String,
}

impl RoleModels {
    /// Environment variables with defaults:
    /// - GATEWAY_PLANNER_MODEL, GATEWAY_SUMMARIZER_MODEL,
    ///   GATEWAY_ANSWERER_MODEL, GATEWAY_UTILITY_MODEL
    pub fn from_env() -> Self {
        let var = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        Self {
            planner: var("GATEWAY_PLANNER_MODEL", "openai/gpt-4.1"),
            summarizer: var("GATEWAY_SUMMARIZER_MODEL", "openai/gpt-4.1-mini"),
            answerer: var("GATEWAY_ANSWERER_MODEL", "openai/gpt-4.1"),
            utility: var("GATEWAY_UTILITY_MODEL", "openai/gpt-4.1-mini"),
        }
    }
}

/// HTTP client for the model gateway
#[derive(Clone)]
pub struct HttpModelGateway {
    base_url: String,
    secret: String,
    models: RoleModels,
    client: reqwest::Client,
    streaming_client: reqwest::Client,
}

// OpenAI-compatible API structures
#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(w: WireUsage) -> Self {
        Self {
            prompt_tokens: w.prompt_tokens,
            completion_tokens: w.completion_tokens,
        }
    }
}

impl HttpModelGateway {
    pub fn new(base_url: String, secret: String, models: RoleModels) -> Self {
        Self {
            base_url,
            secret,
            models,
            client: http_client::gateway_client(),
            streaming_client: http_client::gateway_streaming_client(),
        }
    }

    fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Planner => &self.models.planner,
            ModelRole::Summarizer => &self.models.summarizer,
            ModelRole::Answerer => &self.models.answerer,
            ModelRole::Utility => &self.models.utility,
        }
    }

    fn build_messages(request: &GenerateRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });
        messages
    }

    fn authed(
        &self,
        builder: reqwest::RequestBuilder,
        trace_id: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = builder
            .header(INTERNAL_SECRET_HEADER, &self.secret)
            .header("Content-Type", "application/json");
        match trace_id {
            Some(id) => builder.header(TRACE_ID_HEADER, id),
            None => builder,
        }
    }

    async fn completion(
        &self,
        request: &GenerateRequest,
        response_format: Option<Value>,
    ) -> Result<(String, TokenUsage)> {
        let body = ChatCompletionRequest {
            model: self.model_for(request.role).to_string(),
            messages: Self::build_messages(request),
            stream: false,
            response_format,
        };

        let response = self
            .authed(
                self.client
                    .post(format!("{}/v1/chat/completions", self.base_url)),
                request.trace_id.as_deref(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Error::Gateway(format!(
                "Gateway error ({}): {}",
                status, error_text
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Gateway(format!("Failed to parse response: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Gateway("No choices in response".to_string()))?
            .message
            .content;

        Ok((content, completion.usage.unwrap_or_default().into()))
    }
}

/// Strip a surrounding markdown code fence, if present. Models in JSON mode
/// still occasionally wrap the object in ```json fences.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[async_trait::async_trait]
impl ModelGateway for HttpModelGateway {
    async fn generate_text(&self, request: GenerateRequest) -> Result<TextResponse> {
        let (text, usage) = self.completion(&request, None).await?;
        Ok(TextResponse { text, usage })
    }

    async fn generate_object(
        &self,
        request: GenerateRequest,
        schema: Value,
    ) -> Result<ObjectResponse> {
        // JSON mode plus the schema in the system prompt. The typed caller
        // re-validates, so a drifting reply fails loudly there.
        let schema_instruction = format!(
            "Respond with a single JSON object matching this JSON Schema. \
             No prose, no markdown fences.\n\n{}",
            serde_json::to_string_pretty(&schema)?
        );
        let system = match &request.system {
            Some(existing) => format!("{}\n\n{}", existing, schema_instruction),
            None => schema_instruction,
        };
        let request = GenerateRequest {
            system: Some(system),
            ..request
        };

        let (text, usage) = self
            .completion(&request, Some(serde_json::json!({"type": "json_object"})))
            .await?;

        let value: Value = serde_json::from_str(strip_code_fence(&text))
            .map_err(|e| Error::Gateway(format!("Structured decoding failed: {}", e)))?;

        Ok(ObjectResponse { value, usage })
    }

    async fn stream_text(&self, request: GenerateRequest) -> Result<TextStream> {
        let body = ChatCompletionRequest {
            model: self.model_for(request.role).to_string(),
            messages: Self::build_messages(&request),
            stream: true,
            response_format: None,
        };

        let response = self
            .authed(
                self.streaming_client
                    .post(format!("{}/v1/chat/completions", self.base_url)),
                request.trace_id.as_deref(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("Stream connection failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Gateway(format!(
                "Gateway error ({}): {}",
                status, error_text
            )));
        }

        let stream: TextStream = Box::pin(try_stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();

            'outer: while let Some(chunk) = bytes_stream.next().await {
                let chunk = chunk.map_err(|e| Error::Gateway(format!("Stream error: {}", e)))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete SSE lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || !line.starts_with("data: ") {
                        continue;
                    }

                    let data = &line[6..]; // Strip "data: " prefix

                    if data == "[DONE]" {
                        break 'outer;
                    }

                    if let Ok(json) = serde_json::from_str::<Value>(data) {
                        if let Some(content) = json
                            .get("choices")
                            .and_then(|c| c.as_array())
                            .and_then(|c| c.first())
                            .and_then(|c| c.get("delta"))
                            .and_then(|d| d.get("content"))
                            .and_then(|c| c.as_str())
                        {
                            if !content.is_empty() {
                                yield StreamChunk::Delta(content.to_string());
                            }
                        }

                        if let Some(usage_obj) = json.get("usage") {
                            usage.prompt_tokens = usage_obj
                                .get("prompt_tokens")
                                .and_then(|t| t.as_u64())
                                .unwrap_or(0);
                            usage.completion_tokens = usage_obj
                                .get("completion_tokens")
                                .and_then(|t| t.as_u64())
                                .unwrap_or(0);
                        }
                    }
                }
            }

            yield StreamChunk::Done(usage);
        });

        Ok(stream)
    }
}
