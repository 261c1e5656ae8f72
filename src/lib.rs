//! Delver - Deep-Research Agent
//!
//! Given a conversation ending in a user question, Delver produces a
//! grounded, cited answer by iteratively searching the web, fetching and
//! summarizing pages, and deciding step by step whether enough evidence has
//! been gathered. Progress streams to the client as typed events while the
//! loop runs.

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod gateway;
pub mod http_client;
pub mod ids;
pub mod kv;
pub mod limiter;
pub mod middleware;
pub mod observability;
pub mod search;
pub mod server;
pub mod types;

// Re-export main types
pub use agent::{AgentLoop, LoopOutcome, OutcomeKind, SystemContext};
pub use config::Config;
pub use database::Database;
pub use error::{Error, Result};
pub use server::AppState;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
