//! Runtime configuration loaded from the environment.
//!
//! All knobs have safe defaults and enforced minimums so a missing or
//! malformed variable can never disable a limit.

use crate::error::{Error, Result};

fn parse_env<T: std::str::FromStr + Ord>(key: &str, default: T, min: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
        .max(min)
}

/// Rate limit applied to the chat endpoint.
///
/// Fixed-window counters: `max_requests` per `window_ms`, keyed by
/// `key_prefix`, with up to `max_retries` waits for the next window.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: i64,
    pub window_ms: u64,
    pub key_prefix: String,
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window_ms: 60_000,
            key_prefix: "chat_api".to_string(),
            max_retries: 3,
        }
    }
}

impl RateLimitConfig {
    /// Environment variables:
    /// - RATE_LIMIT_MAX_REQUESTS (default: 20, min: 1)
    /// - RATE_LIMIT_WINDOW_MS (default: 60000, min: 1000)
    /// - RATE_LIMIT_MAX_RETRIES (default: 3, min: 0)
    pub fn from_env() -> Self {
        Self {
            max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", 20, 1),
            window_ms: parse_env("RATE_LIMIT_WINDOW_MS", 60_000, 1_000),
            key_prefix: std::env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| "chat_api".to_string()),
            max_retries: parse_env("RATE_LIMIT_MAX_RETRIES", 3, 0),
        }
    }
}

/// Agent loop and search pipeline knobs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Loop budget: maximum planner steps per request
    pub max_steps: u32,
    /// `num` passed to the search provider
    pub search_results_count: u8,
    /// Prefix of search results to fetch and summarize
    pub max_pages_to_scrape: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            search_results_count: 3,
            max_pages_to_scrape: 6,
        }
    }
}

impl AgentConfig {
    /// Environment variables:
    /// - MAX_STEPS (default: 5, min: 1)
    /// - SEARCH_RESULTS_COUNT (default: 3, min: 1)
    /// - MAX_PAGES_TO_SCRAPE (default: 6, min: 1)
    pub fn from_env() -> Self {
        Self {
            max_steps: parse_env("MAX_STEPS", 5, 1),
            search_results_count: parse_env("SEARCH_RESULTS_COUNT", 3, 1),
            max_pages_to_scrape: parse_env("MAX_PAGES_TO_SCRAPE", 6, 1),
        }
    }
}

/// Upstream endpoints and secrets.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Model gateway base URL (OpenAI-compatible proxy)
    pub gateway_url: String,
    /// Shared secret between Delver and the gateway
    pub gateway_secret: String,
    /// Search provider endpoint
    pub search_url: String,
    /// Search provider API key
    pub search_api_key: String,
    /// Page fetcher (scraper) endpoint
    pub scraper_url: String,
}

impl UpstreamConfig {
    pub fn from_env() -> Result<Self> {
        let gateway_url = std::env::var("GATEWAY_URL").unwrap_or_else(|_| {
            tracing::warn!("GATEWAY_URL not set, using default localhost:9100");
            "http://localhost:9100".to_string()
        });
        let gateway_secret = std::env::var("GATEWAY_INTERNAL_SECRET")
            .map_err(|_| Error::Configuration("GATEWAY_INTERNAL_SECRET not set".into()))?;

        crate::gateway::validate_secret(&gateway_secret)?;

        let search_url = std::env::var("SEARCH_API_URL")
            .unwrap_or_else(|_| "https://google.serper.dev/search".to_string());
        let search_api_key = std::env::var("SEARCH_API_KEY")
            .map_err(|_| Error::Configuration("SEARCH_API_KEY not set".into()))?;
        let scraper_url = std::env::var("SCRAPER_API_URL")
            .unwrap_or_else(|_| "http://localhost:9200/scrape".to_string());

        Ok(Self {
            gateway_url,
            gateway_secret,
            search_url,
            search_api_key,
            scraper_url,
        })
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
    /// Result cache TTL in seconds
    pub cache_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            agent: AgentConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            upstream: UpstreamConfig::from_env()?,
            // CACHE_TTL_SECS (default: 6h, min: 60s)
            cache_ttl_secs: parse_env("CACHE_TTL_SECS", 21_600, 60),
        })
    }
}
