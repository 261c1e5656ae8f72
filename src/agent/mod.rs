//! Agent Module
//!
//! The deep-research loop: a planner proposes the next action, the search
//! pipeline gathers evidence, and an answerer streams the final cited
//! response once the planner decides the evidence suffices or the step
//! budget runs out.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        AgentLoop                           │
//! │  1. Guardrail  (refuse → stream refusal, stop)             │
//! │  2. Clarifier  (ambiguous → stream question, stop)         │
//! │  3. While budget remains:                                  │
//! │     a. Planner → continue | answer                         │
//! │     b. continue: rewrite query → search → fetch →          │
//! │        summarize → evidence grows, events stream           │
//! │     c. answer: stream cited answer, done                   │
//! │  4. Budget exhausted → final-mode answer (gaps admitted)   │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod answer;
pub mod context;
pub mod gate;
pub mod planner;
pub mod protocol;
pub mod rewrite;

pub use answer::{Answerer, MarkdownJoiner, Smoother};
pub use context::{SearchEntry, SearchResult, SystemContext, UsageEntry, UserLocation};
pub use gate::{Clarifier, ClarifierVerdict, GuardDecision, Guardrail, GuardrailVerdict};
pub use planner::{Action, Planner};
pub use protocol::{serialize_event, StreamEvent, StreamWriter, DONE_MARKER, USAGE_EVENT_ID};
pub use rewrite::QueryRewriter;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::gateway::{GenerateRequest, ModelGateway, ModelRole};
use crate::search::SearchPipeline;
use crate::types::Part;

/// How a loop run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// An answer was streamed (planner decision or budget exhaustion)
    Answered,
    /// The guardrail refused the request
    Refused,
    /// The clarifier asked the user for missing information
    Clarification,
    /// The client disconnected or the request was cancelled mid-run
    Cancelled,
}

/// Result of one loop run: what was streamed, ready for persistence.
#[derive(Debug)]
pub struct LoopOutcome {
    pub kind: OutcomeKind,
    /// Full text of the streamed response
    pub answer_text: String,
    /// Message parts mirroring the emitted events, in order
    pub parts: Vec<Part>,
}

const REFUSAL_TEXT: &str =
    "I'm sorry, but I can't help with that request. If you have a different \
     question I can research, I'm happy to help.";

/// The loop controller.
pub struct AgentLoop {
    guardrail: Guardrail,
    clarifier: Clarifier,
    planner: Planner,
    rewriter: QueryRewriter,
    answerer: Answerer,
    gateway: Arc<dyn ModelGateway>,
    pipeline: SearchPipeline,
}

impl AgentLoop {
    pub fn new(gateway: Arc<dyn ModelGateway>, pipeline: SearchPipeline) -> Self {
        Self {
            guardrail: Guardrail::new(Arc::clone(&gateway)),
            clarifier: Clarifier::new(Arc::clone(&gateway)),
            planner: Planner::new(Arc::clone(&gateway)),
            rewriter: QueryRewriter::new(Arc::clone(&gateway)),
            answerer: Answerer::new(Arc::clone(&gateway)),
            gateway,
            pipeline,
        }
    }

    /// Replace the output smoother (tests use a zero-delay one).
    pub fn with_smoother(mut self, smoother: Smoother) -> Self {
        self.answerer = Answerer::new(Arc::clone(&self.gateway)).with_smoother(smoother);
        self
    }

    /// Run the loop to completion, streaming events through `writer`.
    pub async fn run(
        &self,
        ctx: &mut SystemContext,
        writer: &StreamWriter,
        cancel: &CancellationToken,
        text_id: &str,
    ) -> LoopOutcome {
        let mut parts: Vec<Part> = Vec::new();

        // 1. Guardrail. A failed call is fatal for research but still gets
        // the user a best-effort final answer.
        let mut fatal = false;
        match self.guardrail.classify(ctx).await {
            Ok(verdict) if verdict.decision == GuardDecision::Refuse => {
                return self.stream_refusal(ctx, writer, text_id, parts).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "Guardrail call failed");
                fatal = true;
            }
        }

        // 2. Clarifier. Errors here are transient: proceed with research.
        if !fatal {
            match self.clarifier.assess(ctx).await {
                Ok(verdict) if verdict.needs_clarification => {
                    let reason = verdict
                        .reason
                        .unwrap_or_else(|| "the question is ambiguous".to_string());
                    return self
                        .stream_clarification(ctx, writer, text_id, parts, reason)
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Clarifier call failed, proceeding");
                }
            }
        }

        // 3. Research loop
        let mut answered: Option<String> = None;
        let mut text_started = false;
        while !fatal && !ctx.should_stop() {
            if cancel.is_cancelled() || writer.is_closed() {
                return LoopOutcome {
                    kind: OutcomeKind::Cancelled,
                    answer_text: String::new(),
                    parts,
                };
            }

            let action = match self.planner.decide(ctx).await {
                Ok(action) => action,
                Err(e) => {
                    tracing::error!(error = %e, "Planner failed, falling through to final answer");
                    fatal = true;
                    break;
                }
            };

            let action_value = serde_json::to_value(&action).unwrap_or_default();
            let step = ctx.current_step();
            let max_steps = ctx.max_steps();
            tracing::info!(step, action = ?action_value.get("type"), "Agent loop step");
            if let Some(m) = crate::observability::metrics() {
                m.record_loop_step();
            }

            writer
                .write(&StreamEvent::NewAction {
                    action: action_value.clone(),
                    step,
                    max_steps,
                })
                .await;
            parts.push(Part::NewAction {
                action: action_value,
                step,
                max_steps,
            });

            match action {
                Action::Continue {
                    query, feedback, ..
                } => {
                    ctx.set_last_feedback(feedback);
                    writer
                        .write(&StreamEvent::Usage {
                            total_tokens: ctx.total_tokens(),
                        })
                        .await;

                    let rewritten = self.rewriter.rewrite(ctx, &query).await;
                    let sources = self.pipeline.run(ctx, writer, &rewritten).await;
                    parts.push(Part::Sources { sources });

                    writer
                        .write(&StreamEvent::Usage {
                            total_tokens: ctx.total_tokens(),
                        })
                        .await;

                    ctx.increment_step();
                }
                Action::Answer { .. } => {
                    ctx.increment_step();
                    writer
                        .write(&StreamEvent::TextStart {
                            id: text_id.to_string(),
                        })
                        .await;
                    text_started = true;
                    match self.answerer.stream_answer(ctx, false, writer, text_id).await {
                        Ok(text) => answered = Some(text),
                        Err(e) => {
                            tracing::error!(error = %e, "Answerer failed");
                            fatal = true;
                        }
                    }
                    break;
                }
            }
        }

        // 4. Budget exhausted or a fatal stage error: answer best-effort
        let answer_text = match answered {
            Some(text) => text,
            None => {
                if cancel.is_cancelled() || writer.is_closed() {
                    return LoopOutcome {
                        kind: OutcomeKind::Cancelled,
                        answer_text: String::new(),
                        parts,
                    };
                }
                if !text_started {
                    writer
                        .write(&StreamEvent::TextStart {
                            id: text_id.to_string(),
                        })
                        .await;
                }
                match self.answerer.stream_answer(ctx, true, writer, text_id).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Final-mode answerer failed");
                        let text = "I wasn't able to complete the research for this \
                                    question. Please try again."
                            .to_string();
                        self.answerer.stream_static(writer, text_id, &text).await;
                        text
                    }
                }
            }
        };

        writer
            .write(&StreamEvent::TextEnd {
                id: text_id.to_string(),
            })
            .await;
        writer
            .write(&StreamEvent::Usage {
                total_tokens: ctx.total_tokens(),
            })
            .await;

        parts.push(Part::Text {
            text: answer_text.clone(),
        });
        parts.push(Part::Usage {
            total_tokens: ctx.total_tokens(),
        });

        LoopOutcome {
            kind: OutcomeKind::Answered,
            answer_text,
            parts,
        }
    }

    async fn stream_refusal(
        &self,
        ctx: &mut SystemContext,
        writer: &StreamWriter,
        text_id: &str,
        mut parts: Vec<Part>,
    ) -> LoopOutcome {
        writer
            .write(&StreamEvent::TextStart {
                id: text_id.to_string(),
            })
            .await;
        self.answerer
            .stream_static(writer, text_id, REFUSAL_TEXT)
            .await;
        writer
            .write(&StreamEvent::TextEnd {
                id: text_id.to_string(),
            })
            .await;

        parts.push(Part::Text {
            text: REFUSAL_TEXT.to_string(),
        });
        parts.push(Part::Usage {
            total_tokens: ctx.total_tokens(),
        });

        LoopOutcome {
            kind: OutcomeKind::Refused,
            answer_text: REFUSAL_TEXT.to_string(),
            parts,
        }
    }

    async fn stream_clarification(
        &self,
        ctx: &mut SystemContext,
        writer: &StreamWriter,
        text_id: &str,
        mut parts: Vec<Part>,
        reason: String,
    ) -> LoopOutcome {
        writer
            .write(&StreamEvent::Clarification {
                reason: reason.clone(),
            })
            .await;

        // Ask the user for the missing info identified by the clarifier
        let prompt = format!(
            "The user asked: {}\n\nThe question cannot be researched yet \
             because: {}\n\nWrite one short, friendly question asking the \
             user for exactly that missing information.",
            ctx.latest_user_message(),
            reason
        );
        let question = match self
            .gateway
            .generate_text(
                GenerateRequest::new(ModelRole::Utility, prompt)
                    .with_trace_id(crate::gateway::new_trace_id()),
            )
            .await
        {
            Ok(response) => {
                ctx.report_usage("clarification-question", response.usage);
                response.text
            }
            Err(e) => {
                tracing::warn!(error = %e, "Clarification question generation failed");
                format!("Could you tell me more? Specifically: {}", reason)
            }
        };

        writer
            .write(&StreamEvent::TextStart {
                id: text_id.to_string(),
            })
            .await;
        self.answerer.stream_static(writer, text_id, &question).await;
        writer
            .write(&StreamEvent::TextEnd {
                id: text_id.to_string(),
            })
            .await;

        parts.push(Part::Text {
            text: question.clone(),
        });
        parts.push(Part::Usage {
            total_tokens: ctx.total_tokens(),
        });

        LoopOutcome {
            kind: OutcomeKind::Clarification,
            answer_text: question,
            parts,
        }
    }
}
