//! Planner stage
//!
//! One structured LLM call per loop step deciding whether to keep
//! searching or answer now. The decision is a tagged variant; `continue`
//! must carry the next query and feedback on what is still missing.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::context::SystemContext;
use crate::error::Result;
use crate::gateway::{generate_object_as, GenerateRequest, ModelGateway, ModelRole};

/// A planner decision.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
pub enum Action {
    /// Keep searching: run `query` next; `feedback` names what is missing
    #[serde(rename = "continue")]
    Continue {
        /// Short UI label for this step
        title: String,
        reasoning: String,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    /// Enough evidence gathered: produce the final answer
    #[serde(rename = "answer")]
    Answer { title: String, reasoning: String },
}

impl Action {
    pub fn is_continue(&self) -> bool {
        matches!(self, Action::Continue { .. })
    }
}

/// Planner over the model gateway.
pub struct Planner {
    gateway: Arc<dyn ModelGateway>,
}

impl Planner {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }

    /// Decide the next action. A reply that fails structured decoding, or a
    /// `continue` without a usable query, is a fatal planner error - the
    /// loop falls through to the final-mode answerer.
    pub async fn decide(&self, ctx: &mut SystemContext) -> Result<Action> {
        let request = GenerateRequest::new(ModelRole::Planner, build_planner_prompt(ctx))
            .with_system(PLANNER_SYSTEM.to_string())
            .with_trace_id(crate::gateway::new_trace_id());

        let (action, usage) = generate_object_as::<Action>(self.gateway.as_ref(), request).await?;
        ctx.report_usage("planner", usage);

        if let Action::Continue { query, .. } = &action {
            if query.trim().is_empty() {
                return Err(crate::Error::Gateway(
                    "Planner returned continue without a query".into(),
                ));
            }
        }

        Ok(action)
    }
}

const PLANNER_SYSTEM: &str = "You are the research planner of a deep-research agent. \
Each step you either continue searching the web or decide the gathered \
evidence answers the user's question.

Rules:
- Prefer \"continue\" until the evidence plausibly answers the question.
- If recent searches returned zero results, stop narrowing: broaden the \
query or answer with what you have.
- When you return \"continue\", always include a \"feedback\" string \
describing what is still missing, to guide the next search.
- Keep \"title\" to a short label suitable for a progress indicator.";

fn build_planner_prompt(ctx: &SystemContext) -> String {
    let mut prompt = format!(
        "Current date: {}\n\n",
        Utc::now().format("%A, %B %d, %Y")
    );

    let location = ctx.user_location_context();
    if !location.is_empty() {
        prompt.push_str(&location);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!(
        "<search_history>\n{}\n</search_history>\n\n",
        ctx.search_history_text()
    ));

    if let Some(feedback) = ctx.last_feedback() {
        prompt.push_str(&format!(
            "<previous_feedback>\n{}\n</previous_feedback>\n\n",
            feedback
        ));
    }

    prompt.push_str(&format!(
        "<conversation>\n{}\n</conversation>\n\n",
        ctx.conversation_history()
    ));
    prompt.push_str(&format!("Initial question: {}\n", ctx.initial_question()));
    prompt.push_str(&format!(
        "Latest user message: {}\n\n",
        ctx.latest_user_message()
    ));
    prompt.push_str("Decide the next action.");

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, Role};

    #[test]
    fn test_action_continue_round_trip() {
        let json = r#"{
            "type": "continue",
            "title": "Checking release notes",
            "reasoning": "Need the exact version number",
            "query": "rust latest stable version",
            "feedback": "Missing the release date"
        }"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert!(action.is_continue());
        match action {
            Action::Continue { query, feedback, .. } => {
                assert_eq!(query, "rust latest stable version");
                assert_eq!(feedback.as_deref(), Some("Missing the release date"));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_continue_without_query_is_rejected() {
        let json = r#"{"type": "continue", "title": "t", "reasoning": "r"}"#;
        assert!(serde_json::from_str::<Action>(json).is_err());
    }

    #[test]
    fn test_answer_needs_no_query() {
        let json = r#"{"type": "answer", "title": "Answering", "reasoning": "Enough evidence"}"#;
        let action: Action = serde_json::from_str(json).unwrap();
        assert!(!action.is_continue());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type": "ponder", "title": "t", "reasoning": "r"}"#;
        assert!(serde_json::from_str::<Action>(json).is_err());
    }

    #[test]
    fn test_prompt_contains_context_sections() {
        let mut ctx = SystemContext::new(
            vec![Message::text("m1", Role::User, "What is Rust?")],
            None,
            5,
        );
        ctx.set_last_feedback(Some("need version info".into()));

        let prompt = build_planner_prompt(&ctx);
        assert!(prompt.contains("Current date:"));
        assert!(prompt.contains("<search_history>"));
        assert!(prompt.contains("<previous_feedback>\nneed version info"));
        assert!(prompt.contains("Initial question: What is Rust?"));
    }
}
