//! Semantic ID generation utilities
//!
//! Collision-resistant IDs using a universal `prefix_hash` paradigm. All IDs
//! follow the pattern `{prefix}_{hash16}`, where the hash is derived from a
//! set of "uniqueness components" that together define the entity.

use sha2::{Digest, Sha256};

pub const USER_PREFIX: &str = "user";
pub const AUTH_SESSION_PREFIX: &str = "authsession";
pub const CHAT_PREFIX: &str = "chat";
pub const MESSAGE_PREFIX: &str = "msg";

/// Generate a collision-resistant ID from components.
/// Format: `{prefix}_{hash16}`
///
/// The hash is deterministic - same components always produce the same ID.
/// Callers that need a fresh ID include a UUID in the components.
pub fn generate_id(prefix: &str, components: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for component in components {
        hasher.update(component.as_bytes());
        hasher.update(b"|"); // Separator to avoid collisions like ["ab", "c"] vs ["a", "bc"]
    }
    let hash = hasher.finalize();
    let hash_str = hex::encode(&hash[..8]); // 16 hex chars from 8 bytes
    format!("{}_{}", prefix, hash_str)
}

/// Extract prefix from a semantic ID
/// Example: `chat_a1b2c3d4e5f6a7b8` → `chat`
pub fn extract_prefix(id: &str) -> Option<&str> {
    id.split('_').next()
}

/// Validate if an ID matches a specific prefix
pub fn validate_prefix(id: &str, expected_prefix: &str) -> bool {
    extract_prefix(id) == Some(expected_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_deterministic() {
        let id1 = generate_id(CHAT_PREFIX, &["user_abc", "What is Rust?"]);
        let id2 = generate_id(CHAT_PREFIX, &["user_abc", "What is Rust?"]);
        assert_eq!(id1, id2);

        let id3 = generate_id(CHAT_PREFIX, &["user_abc", "What is Go?"]);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_generate_id_format() {
        let id = generate_id(MESSAGE_PREFIX, &["chat_1", "payload"]);
        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), "msg_".len() + 16);
    }

    #[test]
    fn test_generate_id_separator_prevents_collisions() {
        // ["ab", "c"] should differ from ["a", "bc"]
        let id1 = generate_id("test", &["ab", "c"]);
        let id2 = generate_id("test", &["a", "bc"]);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_validate_prefix() {
        assert!(validate_prefix("chat_a1b2c3d4e5f6a7b8", "chat"));
        assert!(!validate_prefix("chat_a1b2c3d4e5f6a7b8", "msg"));
    }
}
