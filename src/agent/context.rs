//! Per-request system context
//!
//! All state the pipeline stages read and write for one request: the
//! conversation, the accumulated search evidence, the step counter, the
//! evaluator feedback, the token-usage ledger, and the optional user
//! location. Pure in-memory; owned by exactly one in-flight request, so no
//! locking.

use crate::types::{Message, Role};

/// One search result, with the summary the summarizer produced for its URL.
/// `summary == None` means the fetch/summarize pipeline failed for that URL.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub date: Option<String>,
    pub summary: Option<String>,
}

/// One executed search: the post-rewrite query and its results.
/// Appended to the context, never mutated.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// Token usage recorded by one LLM call.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub description: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageEntry {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Optional request origin, read from request metadata.
#[derive(Debug, Clone, Default)]
pub struct UserLocation {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

impl UserLocation {
    pub fn is_empty(&self) -> bool {
        self.latitude.is_none()
            && self.longitude.is_none()
            && self.city.is_none()
            && self.country.is_none()
    }
}

/// Per-request mutable container threaded through every pipeline stage.
#[derive(Debug)]
pub struct SystemContext {
    conversation: Vec<Message>,
    searches: Vec<SearchEntry>,
    step: u32,
    max_steps: u32,
    last_feedback: Option<String>,
    usage: Vec<UsageEntry>,
    location: Option<UserLocation>,
}

impl SystemContext {
    pub fn new(conversation: Vec<Message>, location: Option<UserLocation>, max_steps: u32) -> Self {
        Self {
            conversation,
            searches: Vec::new(),
            step: 0,
            max_steps,
            last_feedback: None,
            usage: Vec::new(),
            location: location.filter(|l| !l.is_empty()),
        }
    }

    /// First user message, flattened to text.
    pub fn initial_question(&self) -> String {
        self.conversation
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.flattened_text())
            .unwrap_or_default()
    }

    /// Last user message, flattened to text.
    pub fn latest_user_message(&self) -> String {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.flattened_text())
            .unwrap_or_default()
    }

    /// Readable transcript for prompt injection.
    pub fn conversation_history(&self) -> String {
        self.conversation
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    Role::User => "Human",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                };
                format!("{}: {}", speaker, m.flattened_text())
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The ordered conversation, unmodified.
    pub fn full_conversation_messages(&self) -> &[Message] {
        &self.conversation
    }

    /// Append a search entry to the evidence.
    pub fn report_search(&mut self, entry: SearchEntry) {
        self.searches.push(entry);
    }

    pub fn search_history(&self) -> &[SearchEntry] {
        &self.searches
    }

    /// Deterministic rendering of the evidence, used verbatim by the
    /// planner and answerer prompts. Grouped by query; each result is a
    /// sub-block of title, url, snippet, and the URL summary.
    pub fn search_history_text(&self) -> String {
        if self.searches.is_empty() {
            return "No searches have been performed yet.".to_string();
        }

        let mut out = String::new();
        for entry in &self.searches {
            out.push_str(&format!("## Query: \"{}\"\n", entry.query));
            if entry.results.is_empty() {
                out.push_str("(no results)\n\n");
                continue;
            }
            for result in &entry.results {
                out.push_str(&format!("### {}\n", result.title));
                out.push_str(&format!("URL: {}\n", result.url));
                if let Some(date) = &result.date {
                    out.push_str(&format!("Date: {}\n", date));
                }
                out.push_str(&format!("Snippet: {}\n", result.snippet));
                let summary = result
                    .summary
                    .as_deref()
                    .unwrap_or("No summary available for this URL.");
                out.push_str(&format!("<url_summary>\n{}\n</url_summary>\n\n", summary));
            }
        }
        out.trim_end().to_string()
    }

    pub fn set_last_feedback(&mut self, feedback: Option<String>) {
        self.last_feedback = feedback;
    }

    pub fn last_feedback(&self) -> Option<&str> {
        self.last_feedback.as_deref()
    }

    /// Record token usage from one LLM call.
    pub fn report_usage(&mut self, description: impl Into<String>, usage: crate::gateway::TokenUsage) {
        let entry = UsageEntry {
            description: description.into(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        };
        if let Some(m) = crate::observability::metrics() {
            m.record_llm_call(&entry.description, entry.total_tokens());
        }
        self.usage.push(entry);
    }

    pub fn usage_entries(&self) -> &[UsageEntry] {
        &self.usage
    }

    /// Total tokens across the whole request so far.
    pub fn total_tokens(&self) -> u64 {
        self.usage.iter().map(|u| u.total_tokens()).sum()
    }

    /// Short preamble describing where the request came from, or empty.
    pub fn user_location_context(&self) -> String {
        let Some(location) = &self.location else {
            return String::new();
        };

        let mut parts = Vec::new();
        if let Some(city) = &location.city {
            parts.push(format!("city: {}", city));
        }
        if let Some(country) = &location.country {
            parts.push(format!("country: {}", country));
        }
        if let (Some(lat), Some(lon)) = (&location.latitude, &location.longitude) {
            parts.push(format!("coordinates: {}, {}", lat, lon));
        }

        if parts.is_empty() {
            String::new()
        } else {
            format!("About the origin of user's request: {}.", parts.join("; "))
        }
    }

    pub fn current_step(&self) -> u32 {
        self.step
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn increment_step(&mut self) {
        self.step += 1;
    }

    /// True once the loop budget is exhausted.
    pub fn should_stop(&self) -> bool {
        self.step >= self.max_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::TokenUsage;
    use crate::types::Message;

    fn ctx_with(messages: Vec<Message>) -> SystemContext {
        SystemContext::new(messages, None, 5)
    }

    fn sample_conversation() -> Vec<Message> {
        vec![
            Message::text("msg_1", Role::User, "What is the latest Rust version?"),
            Message::text("msg_2", Role::Assistant, "Let me check."),
            Message::text("msg_3", Role::User, "And when was it released?"),
        ]
    }

    #[test]
    fn test_initial_and_latest_user_message() {
        let ctx = ctx_with(sample_conversation());
        assert_eq!(ctx.initial_question(), "What is the latest Rust version?");
        assert_eq!(ctx.latest_user_message(), "And when was it released?");
    }

    #[test]
    fn test_conversation_history_transcript() {
        let ctx = ctx_with(sample_conversation());
        let history = ctx.conversation_history();
        assert!(history.starts_with("Human: What is the latest Rust version?"));
        assert!(history.contains("Assistant: Let me check."));
    }

    #[test]
    fn test_step_progression_and_budget() {
        let mut ctx = ctx_with(vec![]);
        assert_eq!(ctx.current_step(), 0);
        assert!(!ctx.should_stop());

        for _ in 0..5 {
            ctx.increment_step();
        }
        assert_eq!(ctx.current_step(), 5);
        assert!(ctx.should_stop());
    }

    #[test]
    fn test_usage_ledger_totals() {
        let mut ctx = ctx_with(vec![]);
        ctx.report_usage(
            "planner",
            TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
            },
        );
        ctx.report_usage(
            "summarizer",
            TokenUsage {
                prompt_tokens: 300,
                completion_tokens: 80,
            },
        );
        assert_eq!(ctx.usage_entries().len(), 2);
        assert_eq!(ctx.total_tokens(), 500);
    }

    #[test]
    fn test_search_history_text_rendering() {
        let mut ctx = ctx_with(vec![]);
        assert_eq!(
            ctx.search_history_text(),
            "No searches have been performed yet."
        );

        ctx.report_search(SearchEntry {
            query: "rust 1.80 release".into(),
            results: vec![
                SearchResult {
                    title: "Rust 1.80.0 released".into(),
                    url: "https://blog.rust-lang.org/1.80".into(),
                    snippet: "Announcing Rust 1.80.0".into(),
                    date: Some("2024-07-25".into()),
                    summary: Some("Rust 1.80.0 shipped on July 25, 2024.".into()),
                },
                SearchResult {
                    title: "Broken page".into(),
                    url: "https://example.com/broken".into(),
                    snippet: "irrelevant".into(),
                    date: None,
                    summary: None,
                },
            ],
        });

        let text = ctx.search_history_text();
        assert!(text.contains(r#"## Query: "rust 1.80 release""#));
        assert!(text.contains("URL: https://blog.rust-lang.org/1.80"));
        assert!(text.contains("<url_summary>\nRust 1.80.0 shipped on July 25, 2024.\n</url_summary>"));
        assert!(text.contains("No summary available for this URL."));
    }

    #[test]
    fn test_zero_result_entry_renders_empty_block() {
        let mut ctx = ctx_with(vec![]);
        ctx.report_search(SearchEntry {
            query: "no hits".into(),
            results: vec![],
        });
        assert!(ctx.search_history_text().contains("(no results)"));
    }

    #[test]
    fn test_user_location_context() {
        let ctx = SystemContext::new(
            vec![],
            Some(UserLocation {
                latitude: Some("52.52".into()),
                longitude: Some("13.40".into()),
                city: Some("Berlin".into()),
                country: Some("Germany".into()),
            }),
            5,
        );
        let preamble = ctx.user_location_context();
        assert!(preamble.starts_with("About the origin of user's request:"));
        assert!(preamble.contains("Berlin"));

        let ctx = SystemContext::new(vec![], Some(UserLocation::default()), 5);
        assert_eq!(ctx.user_location_context(), "");
    }
}
