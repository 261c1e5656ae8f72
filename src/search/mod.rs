//! Search-and-summarize pipeline
//!
//! One pipeline run per `continue` step: search, select the scrape prefix,
//! announce the sources to the client, fetch the pages, summarize each one
//! concurrently, and append a single SearchEntry to the context. Upstream
//! failures degrade the entry; they never abort the loop.

mod fetcher;
mod provider;
mod summarize;

pub use fetcher::{FetchedPage, HttpFetcher, PageFetcher};
pub use provider::{favicon_url, HttpSearchProvider, OrganicResult, SearchProvider};
pub use summarize::Summarizer;

use futures::future::join_all;
use std::sync::Arc;

use crate::agent::context::{SearchEntry, SearchResult, SystemContext};
use crate::agent::protocol::{StreamEvent, StreamWriter};
use crate::types::SearchSource;

/// Pipeline knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `num` passed to the search provider
    pub search_results_count: u8,
    /// Prefix of results to fetch and summarize
    pub max_pages_to_scrape: usize,
}

/// The search-and-summarize stage.
#[derive(Clone)]
pub struct SearchPipeline {
    provider: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    summarizer: Summarizer,
    config: PipelineConfig,
}

impl SearchPipeline {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        summarizer: Summarizer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            provider,
            fetcher,
            summarizer,
            config,
        }
    }

    /// Run one search for `query`, emitting the sources event and appending
    /// exactly one SearchEntry to the context. Returns the emitted sources
    /// so the caller can persist them as a message part.
    pub async fn run(
        &self,
        ctx: &mut SystemContext,
        writer: &StreamWriter,
        query: &str,
    ) -> Vec<SearchSource> {
        // 1. Search
        let results = match self
            .provider
            .search(query, self.config.search_results_count)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(query, error = %e, "Search failed, recording empty entry");
                Vec::new()
            }
        };

        if let Some(m) = crate::observability::metrics() {
            m.record_search(results.len());
        }

        if results.is_empty() {
            writer
                .write(&StreamEvent::Sources { sources: vec![] })
                .await;
            ctx.report_search(SearchEntry {
                query: query.to_string(),
                results: vec![],
            });
            return vec![];
        }

        // 2. Select the scrape prefix, stable order
        let selected: Vec<OrganicResult> = results
            .into_iter()
            .take(self.config.max_pages_to_scrape)
            .collect();

        // 3. Announce sources before any page is read
        let sources: Vec<SearchSource> = selected
            .iter()
            .map(|r| SearchSource {
                title: r.title.clone(),
                url: r.link.clone(),
                snippet: r.snippet.clone(),
                favicon: favicon_url(&r.link),
            })
            .collect();
        writer
            .write(&StreamEvent::Sources {
                sources: sources.clone(),
            })
            .await;

        // 4. Fetch; a failed batch degrades every page, not the loop
        let urls: Vec<String> = selected.iter().map(|r| r.link.clone()).collect();
        let pages = match self.fetcher.fetch(&urls).await {
            Ok(pages) => pages,
            Err(e) => {
                tracing::warn!(query, error = %e, "Fetch failed for all URLs");
                urls.iter()
                    .map(|url| FetchedPage::error(url, "fetch unavailable"))
                    .collect()
            }
        };

        // 5. Summarize concurrently; rejoin before reporting
        let history = ctx.conversation_history();
        let outcomes = join_all(selected.iter().zip(pages.iter()).map(|(meta, page)| {
            let summarizer = self.summarizer.clone();
            let history = history.clone();
            async move { summarizer.summarize(&history, page, meta, query).await }
        }))
        .await;

        // 6. Report one entry combining metadata and summaries
        let mut entry_results = Vec::with_capacity(selected.len());
        for (meta, outcome) in selected.iter().zip(outcomes) {
            if let Some(usage) = outcome.usage {
                ctx.report_usage(format!("summarize {}", meta.link), usage);
            }
            entry_results.push(SearchResult {
                title: meta.title.clone(),
                url: meta.link.clone(),
                snippet: meta.snippet.clone(),
                date: meta.date.clone(),
                summary: Some(outcome.summary),
            });
        }

        ctx.report_search(SearchEntry {
            query: query.to_string(),
            results: entry_results,
        });

        sources
    }
}
