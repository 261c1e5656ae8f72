//! Query rewriter stage
//!
//! Refines the planner's proposed query using the most recent evaluator
//! feedback and the search attempts so far. Without feedback there is
//! nothing to refine, so the query passes through with no LLM call.

use std::sync::Arc;

use super::context::SystemContext;
use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};

const REWRITER_SYSTEM: &str = "You rewrite web search queries. Produce exactly \
one line: the optimized query, nothing else.

Heuristics:
- Do not duplicate queries that were already tried.
- If previous narrow queries returned zero results, broaden.
- If the user asks for \"recent\" or \"latest\" information, include date \
tokens such as the current year.";

pub struct QueryRewriter {
    gateway: Arc<dyn ModelGateway>,
}

impl QueryRewriter {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Rewrite `query`, falling back to it unchanged when there is no
    /// feedback to act on or the rewrite call fails.
    pub async fn rewrite(&self, ctx: &mut SystemContext, query: &str) -> String {
        let Some(feedback) = ctx.last_feedback().map(str::to_string) else {
            return query.to_string();
        };

        let prompt = format!(
            "<conversation>\n{}\n</conversation>\n\n\
             <previous_searches>\n{}\n</previous_searches>\n\n\
             Feedback on what is still missing:\n{}\n\n\
             Proposed query: {}\n\nRewrite it.",
            ctx.conversation_history(),
            ctx.search_history_text(),
            feedback,
            query
        );
        let request = GenerateRequest::new(ModelRole::Utility, prompt)
            .with_system(REWRITER_SYSTEM.to_string())
            .with_trace_id(crate::gateway::new_trace_id());

        match self.gateway.generate_text(request).await {
            Ok(response) => {
                ctx.report_usage("query-rewriter", response.usage);
                let rewritten = first_line(&response.text);
                if rewritten.is_empty() {
                    query.to_string()
                } else {
                    rewritten
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Query rewrite failed, using original query");
                query.to_string()
            }
        }
    }
}

/// First non-empty line, trimmed of whitespace and stray quotes.
fn first_line(text: &str) -> String {
    text.lines()
        .map(|l| l.trim().trim_matches('"').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_extraction() {
        assert_eq!(first_line("rust 1.80 release date\n"), "rust 1.80 release date");
        assert_eq!(first_line("\n\n  \"quoted query\"  \nsecond"), "quoted query");
        assert_eq!(first_line("   \n\n"), "");
    }
}
