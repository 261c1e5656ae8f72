//! Page fetcher client
//!
//! Retrieves URLs through a scraping service that returns normalized
//! markdown-ish text. Partial failures are part of the contract: a URL
//! that could not be fetched keeps its entry with an error marker body, so
//! downstream summarization degrades per URL instead of failing the batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http_client;

/// One fetched page. `body` is either normalized page text or an
/// `Error: ...` marker.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
}

impl FetchedPage {
    pub fn error(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            url: url.into(),
            body: format!("Error: {}", message),
        }
    }

    pub fn is_error(&self) -> bool {
        self.body.starts_with("Error: ")
    }
}

/// Bulk page retrieval.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch all URLs. The returned list covers every requested URL, in
    /// request order, substituting error markers for per-URL failures.
    async fn fetch(&self, urls: &[String]) -> Result<Vec<FetchedPage>>;
}

/// HTTP fetcher client against the scraping service.
#[derive(Clone)]
pub struct HttpFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: http_client::fetch_client(),
        }
    }
}

#[derive(Serialize)]
struct ScrapeRequest<'a> {
    urls: &'a [String],
}

#[derive(Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    results: Vec<ScrapeEntry>,
}

#[derive(Deserialize)]
struct ScrapeEntry {
    url: String,
    result: ScrapeResult,
}

#[derive(Deserialize)]
struct ScrapeResult {
    success: bool,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, urls: &[String]) -> Result<Vec<FetchedPage>> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&ScrapeRequest { urls })
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("Scrape request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Fetch(format!(
                "Scraper error ({}): {}",
                status, error_text
            )));
        }

        let parsed: ScrapeResponse = response
            .json()
            .await
            .map_err(|e| Error::Fetch(format!("Failed to parse scrape response: {}", e)))?;

        // Preserve request order; URLs the scraper dropped get error markers
        let pages = urls
            .iter()
            .map(|url| {
                match parsed.results.iter().find(|entry| &entry.url == url) {
                    Some(entry) if entry.result.success => FetchedPage {
                        url: url.clone(),
                        body: entry.result.data.clone().unwrap_or_default(),
                    },
                    Some(entry) => FetchedPage::error(
                        url,
                        entry.result.error.as_deref().unwrap_or("fetch failed"),
                    ),
                    None => FetchedPage::error(url, "no result returned"),
                }
            })
            .collect();

        Ok(pages)
    }
}
