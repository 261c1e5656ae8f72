//! Conversation message types.
//!
//! A message is an ordered sequence of parts. Text parts concatenate for
//! string conversion; the `data-*` parts mirror the stream events that were
//! emitted while the assistant turn was produced, so a persisted chat can be
//! replayed by a client exactly as it was streamed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A source reference shown to the client while a search runs.
///
/// The favicon URL is derived from the result domain and never fetched by
/// the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSource {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

/// A discriminated element of a message.
///
/// Order within a message is the render order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Part {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool-invocation")]
    ToolInvocation { name: String, args: Value },

    #[serde(rename = "data-newAction")]
    NewAction {
        action: Value,
        step: u32,
        #[serde(rename = "maxSteps")]
        max_steps: u32,
    },

    #[serde(rename = "data-sources")]
    Sources { sources: Vec<SearchSource> },

    #[serde(rename = "data-usage")]
    Usage {
        #[serde(rename = "totalTokens")]
        total_tokens: u64,
    },

    #[serde(rename = "data-newChatCreated")]
    NewChatCreated {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
}

/// A conversation message: an id, a role, and an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    /// Build a plain text message.
    pub fn text(id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Flatten the text parts into a single string, in render order.
    pub fn flattened_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
