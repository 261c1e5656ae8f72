//! Shared HTTP Client Configuration
//!
//! Pre-configured reqwest clients with the timeout profile each outbound
//! call class needs: search is short, page fetching is medium, LLM calls
//! are long, and streaming LLM calls are the longest. All outbound traffic
//! goes through one of these so deadlines stay consistent.

use std::time::Duration;

/// Connect timeout in seconds (time to establish TCP connection)
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Request timeout for search provider calls in seconds
pub const SEARCH_TIMEOUT_SECS: u64 = 15;

/// Request timeout for page fetcher calls in seconds
pub const FETCH_TIMEOUT_SECS: u64 = 45;

/// Request timeout for regular (non-streaming) gateway requests in seconds
pub const GATEWAY_TIMEOUT_SECS: u64 = 90;

/// Request timeout for streaming gateway requests in seconds
pub const STREAMING_TIMEOUT_SECS: u64 = 300;

fn client_with_timeout(secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(secs))
        .build()
        .expect("Failed to build HTTP client")
}

/// Client for search provider requests (short deadline).
pub fn search_client() -> reqwest::Client {
    client_with_timeout(SEARCH_TIMEOUT_SECS)
}

/// Client for page fetcher requests (medium deadline).
pub fn fetch_client() -> reqwest::Client {
    client_with_timeout(FETCH_TIMEOUT_SECS)
}

/// Client for regular gateway requests (long deadline).
pub fn gateway_client() -> reqwest::Client {
    client_with_timeout(GATEWAY_TIMEOUT_SECS)
}

/// Client for streaming gateway requests (longest deadline, SSE).
pub fn gateway_streaming_client() -> reqwest::Client {
    client_with_timeout(STREAMING_TIMEOUT_SECS)
}
