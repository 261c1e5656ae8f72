//! Model Gateway
//!
//! Uniform interface to the LLM roles the pipeline uses: the planner wants
//! structured JSON decisions, the summarizer wants long-form extraction,
//! the answerer wants a token stream. The gateway is a budget-enforcing
//! OpenAI-compatible proxy authenticated with a shared secret header; see
//! [`http::HttpModelGateway`] for the wire client.
//!
//! Headers:
//!   X-Internal-Secret: <shared_secret>  (required)
//!   X-Trace-Id: <trace_id>              (optional, observability)

mod http;

pub use http::{HttpModelGateway, RoleModels};

use async_trait::async_trait;
use futures::Stream;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use crate::error::{Error, Result};

/// Header name for internal secret authentication
pub const INTERNAL_SECRET_HEADER: &str = "X-Internal-Secret";

/// Header name for the per-call trace id
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Minimum secret length (256 bits)
pub const MIN_SECRET_LENGTH: usize = 32;

/// Validate that the gateway secret meets minimum length requirements
pub fn validate_secret(secret: &str) -> Result<()> {
    if secret.len() < MIN_SECRET_LENGTH {
        return Err(Error::Configuration(format!(
            "GATEWAY_INTERNAL_SECRET must be at least {} characters (got {})",
            MIN_SECRET_LENGTH,
            secret.len()
        )));
    }
    Ok(())
}

/// Logical model role. The gateway maps each role to a concrete model id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    /// Structured JSON decisions (planner, guardrail, clarifier)
    Planner,
    /// Long-form extraction (per-URL summaries)
    Summarizer,
    /// Streaming final responses
    Answerer,
    /// Small utility calls (query rewriting, title generation)
    Utility,
}

/// Token usage for a single call
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A generation request
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub role: ModelRole,
    pub system: Option<String>,
    pub prompt: String,
    /// Trace id forwarded to the gateway for external observability
    pub trace_id: Option<String>,
}

impl GenerateRequest {
    pub fn new(role: ModelRole, prompt: impl Into<String>) -> Self {
        Self {
            role,
            system: None,
            prompt: prompt.into(),
            trace_id: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Result of a text generation call
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Result of a structured generation call
#[derive(Debug, Clone)]
pub struct ObjectResponse {
    pub value: Value,
    pub usage: TokenUsage,
}

/// One element of a streaming text response
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// An incremental text delta
    Delta(String),
    /// Stream finished; carries the aggregate usage
    Done(TokenUsage),
}

/// A streaming text response
pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Uniform interface over the LLM roles.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Generate a complete text response.
    async fn generate_text(&self, request: GenerateRequest) -> Result<TextResponse>;

    /// Generate a JSON object constrained by `schema`.
    async fn generate_object(
        &self,
        request: GenerateRequest,
        schema: Value,
    ) -> Result<ObjectResponse>;

    /// Generate a streaming text response.
    async fn stream_text(&self, request: GenerateRequest) -> Result<TextStream>;
}

/// Typed wrapper over [`ModelGateway::generate_object`]: derives the JSON
/// Schema for `T`, issues the call, and decodes the reply. A reply that does
/// not decode into `T` is a structured-decoding failure.
pub async fn generate_object_as<T>(
    gateway: &dyn ModelGateway,
    request: GenerateRequest,
) -> Result<(T, TokenUsage)>
where
    T: DeserializeOwned + JsonSchema,
{
    let schema = serde_json::to_value(schemars::schema_for!(T))?;
    let response = gateway.generate_object(request, schema).await?;
    let value = serde_json::from_value(response.value)
        .map_err(|e| Error::Gateway(format!("Structured decoding failed: {}", e)))?;
    Ok((value, response.usage))
}

/// Fresh trace id for one gateway call.
pub fn new_trace_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}
