//! Per-URL summarization
//!
//! One summarizer call per fetched page, extracting the facts relevant to
//! the query as a cohesive narrative. Calls are wrapped by the result
//! cache keyed on the full argument tuple, so re-reading the same page for
//! the same query within the TTL costs nothing.

use serde_json::json;
use std::sync::Arc;

use super::fetcher::FetchedPage;
use super::provider::OrganicResult;
use crate::cache::{CacheOutcome, ResultCache};
use crate::error::Result;
use crate::gateway::{GenerateRequest, ModelGateway, ModelRole, TokenUsage};

const SUMMARIZER_SYSTEM: &str = "You summarize a web page against a research \
query. Produce a cohesive narrative of the facts in the page that bear on \
the query. Preserve dates, numbers, and statistics exactly. Never add \
information that is not in the supplied content. If the content is an error \
message or irrelevant, say so in one sentence.";

/// A produced summary plus the usage of the call, when one was made.
/// Cache hits carry no usage.
#[derive(Debug)]
pub struct SummaryOutcome {
    pub summary: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Clone)]
pub struct Summarizer {
    gateway: Arc<dyn ModelGateway>,
    cache: ResultCache,
}

impl Summarizer {
    pub fn new(gateway: Arc<dyn ModelGateway>, cache: ResultCache) -> Self {
        Self { gateway, cache }
    }

    /// Summarize one fetched page. Errors degrade to a snippet-based
    /// fallback summary rather than failing the pipeline.
    pub async fn summarize(
        &self,
        conversation_history: &str,
        page: &FetchedPage,
        metadata: &OrganicResult,
        query: &str,
    ) -> SummaryOutcome {
        let args = json!({
            "conversation": conversation_history,
            "content": page.body,
            "metadata": {
                "title": metadata.title,
                "url": metadata.link,
                "snippet": metadata.snippet,
                "date": metadata.date,
            },
            "query": query,
        });

        let gateway = Arc::clone(&self.gateway);
        let prompt = build_summary_prompt(conversation_history, page, metadata, query);

        let computed: Result<(SummaryValue, CacheOutcome)> = self
            .cache
            .get_or_compute_with_outcome("summarize-url", &args, || async move {
                let request = GenerateRequest::new(ModelRole::Summarizer, prompt)
                    .with_system(SUMMARIZER_SYSTEM.to_string())
                    .with_trace_id(crate::gateway::new_trace_id());
                let response = gateway.generate_text(request).await?;
                Ok(SummaryValue {
                    summary: response.text,
                    prompt_tokens: response.usage.prompt_tokens,
                    completion_tokens: response.usage.completion_tokens,
                })
            })
            .await;

        match computed {
            Ok((value, outcome)) => SummaryOutcome {
                summary: value.summary,
                usage: match outcome {
                    CacheOutcome::Miss => Some(TokenUsage {
                        prompt_tokens: value.prompt_tokens,
                        completion_tokens: value.completion_tokens,
                    }),
                    CacheOutcome::Hit => None,
                },
            },
            Err(e) => {
                tracing::warn!(url = %page.url, error = %e, "Summarization failed, using snippet fallback");
                SummaryOutcome {
                    summary: format!(
                        "Unable to generate summary. Based on snippet: {}",
                        metadata.snippet
                    ),
                    usage: None,
                }
            }
        }
    }
}

/// Serialized cache value: the summary and the usage of the producing call.
#[derive(serde::Serialize, serde::Deserialize)]
struct SummaryValue {
    summary: String,
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_summary_prompt(
    conversation_history: &str,
    page: &FetchedPage,
    metadata: &OrganicResult,
    query: &str,
) -> String {
    format!(
        "Research query: {}\n\n<conversation>\n{}\n</conversation>\n\n\
         Page: {} ({})\nSnippet: {}\n\n<content>\n{}\n</content>\n\n\
         Summarize the facts in the content relevant to the query.",
        query, conversation_history, metadata.title, metadata.link, metadata.snippet, page.body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_value_round_trip() {
        let value = SummaryValue {
            summary: "facts".into(),
            prompt_tokens: 10,
            completion_tokens: 5,
        };
        let raw = serde_json::to_string(&value).unwrap();
        let back: SummaryValue = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.summary, "facts");
        assert_eq!(back.prompt_tokens, 10);
    }

    #[test]
    fn test_prompt_includes_query_and_content() {
        let page = FetchedPage {
            url: "https://x".into(),
            body: "page text".into(),
        };
        let meta = OrganicResult {
            title: "Title".into(),
            link: "https://x".into(),
            snippet: "snip".into(),
            date: None,
        };
        let prompt = build_summary_prompt("Human: hi", &page, &meta, "rust release");
        assert!(prompt.contains("Research query: rust release"));
        assert!(prompt.contains("<content>\npage text\n</content>"));
    }
}
