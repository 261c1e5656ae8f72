//! Shared domain types.

mod message;
mod timestamp;

pub use message::{Message, Part, Role, SearchSource};
pub use timestamp::Timestamp;
