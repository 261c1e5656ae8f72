//! Chat API with SSE streaming
//!
//! Translates a chat request into an agent loop invocation: authenticate,
//! rate-limit, load or create the chat, run the loop on a worker task while
//! events stream to the client, and persist the outcome when the loop
//! completes.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent::context::{SystemContext, UserLocation};
use crate::agent::protocol::{StreamEvent, StreamWriter, DONE_MARKER};
use crate::agent::OutcomeKind;
use crate::api::chats::{self, UpsertChat};
use crate::ids;
use crate::middleware::auth::AuthUser;
use crate::observability::RequestTimer;
use crate::server::AppState;
use crate::types::{Message, Part, Role};

// ============================================================================
// Cancellation State
// ============================================================================

/// Tracks in-flight chat requests so a disconnect or an explicit cancel can
/// stop the loop. Concurrent requests for the same chat coexist; each gets
/// its own token and the map keeps the latest.
#[derive(Clone, Default)]
pub struct ChatCancellationState {
    tokens: Arc<std::sync::RwLock<std::collections::HashMap<String, CancellationToken>>>,
}

impl ChatCancellationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new chat request and get its cancellation token
    pub fn register(&self, chat_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        // Recover from poisoned lock - the data is still valid
        let mut guard = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(chat_id.to_string(), token.clone());
        token
    }

    /// Cancel an active chat request
    pub fn cancel(&self, chat_id: &str) -> bool {
        let guard = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.get(chat_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Remove a chat request (called when the stream completes)
    pub fn remove(&self, chat_id: &str) {
        let mut guard = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        guard.remove(chat_id);
    }

    /// Check if a chat has an active request
    pub fn is_active(&self, chat_id: &str) -> bool {
        let guard = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        guard.contains_key(chat_id)
    }
}

// ============================================================================
// Request types
// ============================================================================

/// Message as sent by the client. Either `parts` or the legacy `content`
/// string.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub parts: Option<Vec<Part>>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<IncomingMessage>,
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteChatRequest {
    #[serde(rename = "chatId")]
    pub chat_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Helpers
// ============================================================================

/// Best-effort user location from request metadata.
fn location_from_headers(headers: &HeaderMap) -> Option<UserLocation> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let location = UserLocation {
        latitude: header("x-geo-latitude"),
        longitude: header("x-geo-longitude"),
        city: header("x-geo-city"),
        country: header("x-geo-country"),
    };

    if location.is_empty() {
        None
    } else {
        Some(location)
    }
}

/// Convert a client message into the stored shape. Unknown roles are a
/// client error.
fn convert_incoming(msg: IncomingMessage, chat_id: &str) -> Result<Message, String> {
    let role: Role = msg.role.parse()?;
    let id = msg.id.unwrap_or_else(|| {
        ids::generate_id(
            ids::MESSAGE_PREFIX,
            &[chat_id, &uuid::Uuid::new_v4().to_string()],
        )
    });

    let parts = match (msg.parts, msg.content) {
        (Some(parts), _) => parts,
        (None, Some(content)) => vec![Part::Text { text: content }],
        (None, None) => vec![],
    };

    Ok(Message { id, role, parts })
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /chat - run the research loop, streaming typed events
pub async fn chat_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let timer = RequestTimer::start();

    // Rate limit: check, then wait for the next window if blocked
    let limit_config = &state.config.rate_limit;
    let status = match state.limiter.check(limit_config).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, "Rate limiter check failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Rate limiter unavailable");
        }
    };
    let status = if status.allowed {
        status
    } else {
        if let Some(m) = crate::observability::metrics() {
            m.record_rate_limited();
        }
        match state.limiter.check_with_retry(limit_config).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "Rate limiter retry failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Rate limiter unavailable");
            }
        }
    };

    if !status.allowed {
        let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        let headers = response.headers_mut();
        let numeric = |n: i64| {
            axum::http::HeaderValue::from_str(&n.to_string())
                .unwrap_or_else(|_| axum::http::HeaderValue::from_static("0"))
        };
        headers.insert("X-RateLimit-Limit", numeric(limit_config.max_requests));
        headers.insert("X-RateLimit-Remaining", numeric(status.remaining));
        headers.insert("X-RateLimit-Reset", numeric(status.reset_time_ms as i64));
        return response;
    }

    if let Err(e) = state.limiter.record(limit_config).await {
        tracing::error!(error = %e, "Failed to record rate limit hit");
    }

    // Chat id: URL param, else body, else fresh
    let chat_id = query
        .id
        .or(request.id)
        .unwrap_or_else(|| {
            ids::generate_id(ids::CHAT_PREFIX, &[&user.id, &uuid::Uuid::new_v4().to_string()])
        });

    // A chat id owned by someone else reads as missing
    let owner = match chats::fetch_owner(&state.pool, &chat_id).await {
        Ok(owner) => owner,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load chat owner");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load chat");
        }
    };
    if matches!(&owner, Some(o) if o != &user.id) {
        return error_response(StatusCode::NOT_FOUND, "Chat not found");
    }
    let is_new_chat = owner.is_none();

    // Prior messages first, then the client's new messages
    let mut conversation: Vec<Message> = if is_new_chat {
        Vec::new()
    } else {
        match chats::get_chat(&state.pool, &chat_id, &user.id).await {
            Ok(Some(chat)) => chat.messages,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load chat messages");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load chat");
            }
        }
    };

    let known_ids: HashSet<String> = conversation.iter().map(|m| m.id.clone()).collect();
    for incoming in request.messages {
        let message = match convert_incoming(incoming, &chat_id) {
            Ok(message) => message,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
        };
        if !known_ids.contains(&message.id) {
            conversation.push(message);
        }
    }

    if !conversation.iter().any(|m| m.role == Role::User) {
        return error_response(StatusCode::BAD_REQUEST, "No user message in request");
    }

    if is_new_chat {
        if let Err(e) = chats::create_chat_if_absent(&state.pool, &user.id, &chat_id).await {
            tracing::error!(error = %e, "Failed to create chat");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create chat");
        }
    }

    // Title generation races the loop; joined before persisting
    let title_task = if is_new_chat {
        let gateway = Arc::clone(&state.gateway);
        let messages = conversation.clone();
        Some(tokio::spawn(async move {
            chats::generate_title(gateway, &messages).await.ok()
        }))
    } else {
        None
    };

    let location = location_from_headers(&headers);
    let cancel = state.cancellations.register(&chat_id);
    let (writer, events) = StreamWriter::channel(64);

    let worker_state = state.clone();
    let worker_chat_id = chat_id.clone();
    let user_id = user.id.clone();
    tokio::spawn(async move {
        if is_new_chat {
            writer
                .write(&StreamEvent::NewChatCreated {
                    chat_id: worker_chat_id.clone(),
                })
                .await;
        }

        let text_id = ids::generate_id(
            ids::MESSAGE_PREFIX,
            &[&worker_chat_id, &uuid::Uuid::new_v4().to_string()],
        );

        let mut ctx = SystemContext::new(
            conversation,
            location,
            worker_state.config.agent.max_steps,
        );
        let outcome = worker_state
            .agent
            .run(&mut ctx, &writer, &cancel, &text_id)
            .await;

        writer.write_raw(DONE_MARKER).await;

        let generated_title = match title_task {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };

        // Persist: full conversation plus the assistant turn that streamed
        let mut messages: Vec<Message> = ctx.full_conversation_messages().to_vec();
        messages.push(Message {
            id: text_id,
            role: Role::Assistant,
            parts: outcome.parts.clone(),
        });

        if let Err(e) = chats::upsert_chat(
            &worker_state.pool,
            UpsertChat {
                user_id: &user_id,
                chat_id: &worker_chat_id,
                title: generated_title.as_deref(),
                messages: &messages,
            },
        )
        .await
        {
            // The stream already ended with its marker; log and move on
            tracing::error!(chat_id = %worker_chat_id, error = %e, "Failed to persist chat");
        }

        worker_state.cancellations.remove(&worker_chat_id);
        timer.finish(match outcome.kind {
            OutcomeKind::Answered => "answered",
            OutcomeKind::Refused => "refused",
            OutcomeKind::Clarification => "clarification",
            OutcomeKind::Cancelled => "cancelled",
        });
    });

    let sse_stream = events.map(|data| {
        Ok::<_, Infallible>(axum::response::sse::Event::default().data(data))
    });

    Sse::new(sse_stream)
        .keep_alive(axum::response::sse::KeepAlive::new())
        .into_response()
}

/// GET /chat?id=... - messages in insertion order
pub async fn get_chat_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ChatQuery>,
) -> Response {
    let Some(chat_id) = query.id else {
        return error_response(StatusCode::BAD_REQUEST, "Missing chat id");
    };

    match chats::get_chat(&state.pool, &chat_id, &user.id).await {
        Ok(Some(chat)) => Json(serde_json::json!({ "messages": chat.messages })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load chat");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load chat")
        }
    }
}

/// DELETE /chat - body {chatId}
pub async fn delete_chat_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<DeleteChatRequest>,
) -> Response {
    match chats::delete_chat(&state.pool, &request.chat_id, &user.id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(crate::Error::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "Chat not found"),
        Err(e) => {
            tracing::error!(error = %e, "Failed to delete chat");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete chat")
        }
    }
}

/// GET /chats - the user's chats, most recent first
pub async fn list_chats_handler(State(state): State<AppState>, user: AuthUser) -> Response {
    match chats::list_chats(&state.pool, &user.id).await {
        Ok(chats) => Json(serde_json::json!({ "chats": chats })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list chats");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list chats")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_state_lifecycle() {
        let state = ChatCancellationState::new();
        let token = state.register("chat_1");
        assert!(state.is_active("chat_1"));
        assert!(!token.is_cancelled());

        assert!(state.cancel("chat_1"));
        assert!(token.is_cancelled());

        state.remove("chat_1");
        assert!(!state.is_active("chat_1"));
        assert!(!state.cancel("chat_1"));
    }

    #[test]
    fn test_convert_incoming_legacy_content() {
        let message = convert_incoming(
            IncomingMessage {
                id: None,
                role: "user".into(),
                parts: None,
                content: Some("hello".into()),
            },
            "chat_1",
        )
        .unwrap();
        assert_eq!(message.role, Role::User);
        assert_eq!(message.flattened_text(), "hello");
        assert!(message.id.starts_with("msg_"));
    }

    #[test]
    fn test_convert_incoming_rejects_unknown_role() {
        let result = convert_incoming(
            IncomingMessage {
                id: None,
                role: "wizard".into(),
                parts: None,
                content: None,
            },
            "chat_1",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_location_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(location_from_headers(&headers).is_none());

        headers.insert("x-geo-city", "Berlin".parse().unwrap());
        headers.insert("x-geo-country", "Germany".parse().unwrap());
        let location = location_from_headers(&headers).unwrap();
        assert_eq!(location.city.as_deref(), Some("Berlin"));
        assert!(location.latitude.is_none());
    }
}
