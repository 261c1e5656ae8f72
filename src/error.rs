//! Error types for Delver

use thiserror::Error;

/// Main error type for Delver
#[derive(Debug, Error)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unauthorized access (no valid session)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Resource exists but belongs to another user
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected by the rate limiter after retries
    #[error("Rate limited, resets at {reset_time_ms} ms")]
    RateLimited { reset_time_ms: u64 },

    /// Model gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Search provider errors
    #[error("Search error: {0}")]
    Search(String),

    /// Page fetcher errors
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQL errors
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Reqwest HTTP client errors
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Delver operations
pub type Result<T> = std::result::Result<T, Error>;
