//! HTTP API: the chat request handler and the chat store.

pub mod chat;
pub mod chats;

pub use chat::ChatCancellationState;
pub use chats::{ChatDetail, ChatSummary, UpsertChat, PROVISIONAL_TITLE};
