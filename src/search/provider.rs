//! Search provider client
//!
//! Issues keyword queries against a Serper-style endpoint and returns the
//! ranked organic results. Everything beyond `organic` in the response
//! (knowledge graph, related searches) passes through unused.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::http_client;

/// One ranked organic result.
#[derive(Debug, Clone, Deserialize)]
pub struct OrganicResult {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// Keyword search over the web.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, num: u8) -> Result<Vec<OrganicResult>>;
}

/// HTTP search provider client.
#[derive(Clone)]
pub struct HttpSearchProvider {
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpSearchProvider {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            url,
            api_key,
            client: http_client::search_client(),
        }
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(&self, query: &str, num: u8) -> Result<Vec<OrganicResult>> {
        #[derive(serde::Serialize)]
        struct SearchRequest<'a> {
            q: &'a str,
            num: u8,
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            #[serde(default)]
            organic: Vec<OrganicResult>,
        }

        let response = self
            .client
            .post(&self.url)
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&SearchRequest { q: query, num })
            .send()
            .await
            .map_err(|e| Error::Search(format!("Search request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Search(format!(
                "Search provider error ({}): {}",
                status, error_text
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::Search(format!("Failed to parse search response: {}", e)))?;

        Ok(parsed.organic)
    }
}

/// Favicon URL for a result link, derived from its domain. Never fetched by
/// the server.
pub fn favicon_url(link: &str) -> Option<String> {
    let parsed = url::Url::parse(link).ok()?;
    let host = parsed.host_str()?;
    Some(format!(
        "https://www.google.com/s2/favicons?domain={}&sz=64",
        host
    ))
}
