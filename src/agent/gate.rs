//! Guardrail and clarifier stages
//!
//! Both run before the research loop. The guardrail classifies the latest
//! user message as allowed or refused; the clarifier decides whether the
//! question is answerable at all without more information from the user.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::context::SystemContext;
use crate::error::Result;
use crate::gateway::{generate_object_as, GenerateRequest, ModelGateway, ModelRole};

/// Guardrail classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GuardDecision {
    Allow,
    Refuse,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GuardrailVerdict {
    pub decision: GuardDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClarifierVerdict {
    pub needs_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

const GUARDRAIL_SYSTEM: &str = "You are a safety classifier for a web research \
assistant. Classify the user's latest request as \"allow\" or \"refuse\". \
Refuse requests for harmful, illegal, or dangerous content. Ordinary \
research questions, even about sensitive topics, are allowed.";

const CLARIFIER_SYSTEM: &str = "You decide whether a research question is \
specific enough to search the web for. Set needs_clarification to true only \
when the question cannot be researched at all without more information from \
the user (for example a bare \"tell me about it\" with no referent). When \
true, state the missing information in \"reason\".";

pub struct Guardrail {
    gateway: Arc<dyn ModelGateway>,
}

impl Guardrail {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }

    pub async fn classify(&self, ctx: &mut SystemContext) -> Result<GuardrailVerdict> {
        let prompt = format!(
            "Latest user message:\n{}\n\nClassify it.",
            ctx.latest_user_message()
        );
        let request = GenerateRequest::new(ModelRole::Planner, prompt)
            .with_system(GUARDRAIL_SYSTEM.to_string())
            .with_trace_id(crate::gateway::new_trace_id());

        let (verdict, usage) =
            generate_object_as::<GuardrailVerdict>(self.gateway.as_ref(), request).await?;
        ctx.report_usage("guardrail", usage);

        if verdict.decision == GuardDecision::Refuse {
            tracing::info!(reason = ?verdict.reason, "Guardrail refused request");
        }

        Ok(verdict)
    }
}

pub struct Clarifier {
    gateway: Arc<dyn ModelGateway>,
}

impl Clarifier {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self { gateway }
    }

    pub async fn assess(&self, ctx: &mut SystemContext) -> Result<ClarifierVerdict> {
        let prompt = format!(
            "<conversation>\n{}\n</conversation>\n\nLatest user message:\n{}\n\n\
             Is this specific enough to research?",
            ctx.conversation_history(),
            ctx.latest_user_message()
        );
        let request = GenerateRequest::new(ModelRole::Planner, prompt)
            .with_system(CLARIFIER_SYSTEM.to_string())
            .with_trace_id(crate::gateway::new_trace_id());

        let (verdict, usage) =
            generate_object_as::<ClarifierVerdict>(self.gateway.as_ref(), request).await?;
        ctx.report_usage("clarifier", usage);

        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guardrail_verdict_decoding() {
        let verdict: GuardrailVerdict =
            serde_json::from_str(r#"{"decision": "refuse", "reason": "weapons"}"#).unwrap();
        assert_eq!(verdict.decision, GuardDecision::Refuse);
        assert_eq!(verdict.reason.as_deref(), Some("weapons"));

        let verdict: GuardrailVerdict = serde_json::from_str(r#"{"decision": "allow"}"#).unwrap();
        assert_eq!(verdict.decision, GuardDecision::Allow);
        assert!(verdict.reason.is_none());
    }

    #[test]
    fn test_clarifier_verdict_decoding() {
        let verdict: ClarifierVerdict =
            serde_json::from_str(r#"{"needs_clarification": true, "reason": "no referent"}"#)
                .unwrap();
        assert!(verdict.needs_clarification);
        assert_eq!(verdict.reason.as_deref(), Some("no referent"));
    }
}
