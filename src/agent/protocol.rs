//! Agent stream protocol
//!
//! One enum of event variants and one serializer. Events go to the client
//! as JSON objects `{type, data?, id?}`; the `data-*` events are wrapped in
//! a data envelope, text events serialize flat. The usage event reuses a
//! stable id so clients dedupe running totals; every other data event gets
//! a fresh id.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::SearchSource;

/// Stable event id for `data-usage` events, so clients replace rather than
/// append running totals.
pub const USAGE_EVENT_ID: &str = "usage-totals";

/// End-of-stream marker.
pub const DONE_MARKER: &str = "[DONE]";

/// Events emitted to the client while the loop runs.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Sent once, before any other event, only for newly created chats
    NewChatCreated { chat_id: String },
    /// Once per loop step: the planner's decision
    NewAction {
        action: Value,
        step: u32,
        max_steps: u32,
    },
    /// Once per search: the sources about to be read
    Sources { sources: Vec<SearchSource> },
    /// Running token totals; stable id
    Usage { total_tokens: u64 },
    /// Emitted only when the clarifier short-circuits
    Clarification { reason: String },
    /// Final answer text framing and deltas
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    /// Client-safe error notice
    Error { message: String },
}

/// Envelope for `data-*` events.
#[derive(Serialize)]
struct DataEvent<T: Serialize> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    data: T,
}

fn data_event<T: Serialize>(event_type: &'static str, id: Option<String>, data: T) -> String {
    serde_json::to_string(&DataEvent {
        event_type,
        id,
        data,
    })
    .unwrap_or_else(|e| {
        tracing::error!("Failed to serialize stream event: {}", e);
        r#"{"type":"error","data":{"message":"Serialization error"}}"#.to_string()
    })
}

fn fresh_event_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

/// Serialize an event to its wire JSON.
pub fn serialize_event(event: &StreamEvent) -> String {
    match event {
        StreamEvent::NewChatCreated { chat_id } => data_event(
            "data-newChatCreated",
            Some(fresh_event_id()),
            serde_json::json!({ "chatId": chat_id }),
        ),
        StreamEvent::NewAction {
            action,
            step,
            max_steps,
        } => data_event(
            "data-newAction",
            Some(fresh_event_id()),
            serde_json::json!({ "action": action, "step": step, "maxSteps": max_steps }),
        ),
        StreamEvent::Sources { sources } => data_event(
            "data-sources",
            Some(fresh_event_id()),
            serde_json::json!(sources),
        ),
        StreamEvent::Usage { total_tokens } => data_event(
            "data-usage",
            Some(USAGE_EVENT_ID.to_string()),
            serde_json::json!({ "totalTokens": total_tokens }),
        ),
        StreamEvent::Clarification { reason } => data_event(
            "data-clarification",
            Some(fresh_event_id()),
            serde_json::json!({ "reason": reason }),
        ),
        StreamEvent::TextStart { id } => {
            serde_json::json!({ "type": "text-start", "id": id }).to_string()
        }
        StreamEvent::TextDelta { id, delta } => {
            serde_json::json!({ "type": "text-delta", "id": id, "delta": delta }).to_string()
        }
        StreamEvent::TextEnd { id } => {
            serde_json::json!({ "type": "text-end", "id": id }).to_string()
        }
        StreamEvent::Error { message } => {
            serde_json::json!({ "type": "error", "data": { "message": message } }).to_string()
        }
    }
}

/// Single-producer typed event channel between the agent loop and the SSE
/// response body. Events are serialized in emission order. When the client
/// disconnects the receiver drops and `write` starts returning false; the
/// loop treats that as cancellation.
pub struct StreamWriter {
    tx: mpsc::Sender<String>,
}

impl StreamWriter {
    /// Create a writer and the stream of serialized events feeding the
    /// response body.
    pub fn channel(buffer: usize) -> (Self, ReceiverStream<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, ReceiverStream::new(rx))
    }

    /// Write one event. Returns false once the client is gone.
    pub async fn write(&self, event: &StreamEvent) -> bool {
        self.tx.send(serialize_event(event)).await.is_ok()
    }

    /// Write a raw payload (the end-of-stream marker).
    pub async fn write_raw(&self, payload: &str) -> bool {
        self.tx.send(payload.to_string()).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(event: &StreamEvent) -> Value {
        serde_json::from_str(&serialize_event(event)).unwrap()
    }

    #[test]
    fn test_event_type_names() {
        let event = parse(&StreamEvent::NewChatCreated {
            chat_id: "chat_1".into(),
        });
        assert_eq!(event["type"], "data-newChatCreated");
        assert_eq!(event["data"]["chatId"], "chat_1");

        let event = parse(&StreamEvent::Clarification {
            reason: "which city?".into(),
        });
        assert_eq!(event["type"], "data-clarification");
        assert_eq!(event["data"]["reason"], "which city?");

        let event = parse(&StreamEvent::TextDelta {
            id: "msg_1".into(),
            delta: "hello".into(),
        });
        assert_eq!(event["type"], "text-delta");
        assert_eq!(event["delta"], "hello");
    }

    #[test]
    fn test_usage_event_id_is_stable() {
        let a = parse(&StreamEvent::Usage { total_tokens: 10 });
        let b = parse(&StreamEvent::Usage { total_tokens: 20 });
        assert_eq!(a["id"], USAGE_EVENT_ID);
        assert_eq!(a["id"], b["id"]);
    }

    #[test]
    fn test_other_data_events_get_fresh_ids() {
        let a = parse(&StreamEvent::Sources { sources: vec![] });
        let b = parse(&StreamEvent::Sources { sources: vec![] });
        assert_ne!(a["id"], b["id"]);
    }

    #[test]
    fn test_new_action_payload_shape() {
        let event = parse(&StreamEvent::NewAction {
            action: serde_json::json!({"type": "continue", "query": "rust"}),
            step: 2,
            max_steps: 5,
        });
        assert_eq!(event["type"], "data-newAction");
        assert_eq!(event["data"]["step"], 2);
        assert_eq!(event["data"]["maxSteps"], 5);
        assert_eq!(event["data"]["action"]["query"], "rust");
    }

    #[tokio::test]
    async fn test_writer_preserves_emission_order() {
        use tokio_stream::StreamExt;

        let (writer, mut rx) = StreamWriter::channel(8);
        assert!(writer.write(&StreamEvent::TextStart { id: "m".into() }).await);
        assert!(
            writer
                .write(&StreamEvent::TextDelta {
                    id: "m".into(),
                    delta: "hi".into()
                })
                .await
        );
        assert!(writer.write_raw(DONE_MARKER).await);
        drop(writer);

        let collected: Vec<String> = (&mut rx).collect().await;
        assert_eq!(collected.len(), 3);
        assert!(collected[0].contains("text-start"));
        assert!(collected[1].contains("text-delta"));
        assert_eq!(collected[2], DONE_MARKER);
    }

    #[tokio::test]
    async fn test_writer_reports_client_disconnect() {
        let (writer, rx) = StreamWriter::channel(1);
        drop(rx);
        assert!(!writer.write(&StreamEvent::Usage { total_tokens: 1 }).await);
        assert!(writer.is_closed());
    }
}
