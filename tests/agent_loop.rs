//! Loop-level scenarios driven by a scripted gateway: the planner decisions
//! are queued, the search provider and fetcher return fixed data, and the
//! emitted event stream is asserted end to end.

mod common;

use std::sync::Arc;

use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use common::*;
use delver::agent::{AgentLoop, LoopOutcome, OutcomeKind, Smoother, StreamWriter, SystemContext};
use delver::cache::ResultCache;
use delver::gateway::ModelGateway;
use delver::kv::KvStore;
use delver::search::{PipelineConfig, SearchPipeline, Summarizer};
use delver::types::{Message, Role};

const MAX_STEPS: u32 = 5;

fn default_results() -> Vec<delver::search::OrganicResult> {
    vec![
        organic(
            "TypeScript 5.5 released",
            "https://devblogs.microsoft.com/typescript/announcing-typescript-5-5",
            "Today we're excited to announce TypeScript 5.5",
        ),
        organic(
            "TypeScript releases",
            "https://github.com/microsoft/TypeScript/releases",
            "Release history",
        ),
    ]
}

/// Build the loop, run it over a single-question conversation, and return
/// the outcome, the context, and the parsed event stream.
async fn run_scenario(
    gateway: ScriptedGateway,
    provider: FixedSearchProvider,
    question: &str,
) -> (LoopOutcome, SystemContext, Vec<Value>) {
    let gateway: Arc<dyn ModelGateway> = Arc::new(gateway);
    let provider = Arc::new(provider);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let pipeline = SearchPipeline::new(
        provider,
        Arc::new(FixedFetcher::new("TypeScript 5.5 shipped in June 2024.")),
        Summarizer::new(Arc::clone(&gateway), ResultCache::new(kv, 3600)),
        PipelineConfig {
            search_results_count: 3,
            max_pages_to_scrape: 6,
        },
    );

    let agent = AgentLoop::new(gateway, pipeline).with_smoother(Smoother {
        words_per_chunk: 50,
        delay_ms: 0,
    });

    let mut ctx = SystemContext::new(
        vec![Message::text("msg_u1", Role::User, question)],
        None,
        MAX_STEPS,
    );
    let (writer, events) = StreamWriter::channel(1024);
    let cancel = CancellationToken::new();

    let outcome = agent.run(&mut ctx, &writer, &cancel, "msg_a1").await;
    drop(writer);

    let raw: Vec<String> = events.collect().await;
    let parsed = raw
        .into_iter()
        .filter(|s| s != delver::agent::DONE_MARKER)
        .map(|s| serde_json::from_str(&s).unwrap())
        .collect();

    (outcome, ctx, parsed)
}

fn events_of_type<'a>(events: &'a [Value], event_type: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e["type"] == event_type)
        .collect()
}

fn streamed_text(events: &[Value]) -> String {
    events
        .iter()
        .filter(|e| e["type"] == "text-delta")
        .filter_map(|e| e["delta"].as_str())
        .collect()
}

fn first_index(events: &[Value], event_type: &str) -> Option<usize> {
    events.iter().position(|e| e["type"] == event_type)
}

#[tokio::test]
async fn simple_factual_query_answers_with_citations() {
    let gateway = ScriptedGateway::new(
        vec![
            allow(),
            no_clarification(),
            continue_action("typescript latest stable version", "need the version number"),
            answer_action(),
        ],
        vec![
            "The latest stable TypeScript version is **5.5**",
            "[^1].\n\n",
            "[^1]: https://devblogs.microsoft.com/typescript/announcing-typescript-5-5",
        ],
    );

    let (outcome, ctx, events) = run_scenario(
        gateway,
        FixedSearchProvider::new(default_results()),
        "Latest TypeScript stable version?",
    )
    .await;

    assert_eq!(outcome.kind, OutcomeKind::Answered);

    // At least one continue action and one non-empty sources event
    let actions = events_of_type(&events, "data-newAction");
    assert!(!actions.is_empty());
    assert_eq!(actions[0]["data"]["action"]["type"], "continue");
    assert_eq!(actions[0]["data"]["maxSteps"], MAX_STEPS);

    let sources = events_of_type(&events, "data-sources");
    assert_eq!(sources.len(), 1);
    assert!(!sources[0]["data"].as_array().unwrap().is_empty());

    // Control events precede the answer text
    let action_at = first_index(&events, "data-newAction").unwrap();
    let sources_at = first_index(&events, "data-sources").unwrap();
    let text_at = first_index(&events, "text-delta").unwrap();
    assert!(action_at < sources_at);
    assert!(sources_at < text_at);

    // The answer carries a version token and a footnote definition, and no
    // inline links
    let text = streamed_text(&events);
    assert!(text.contains("5.5"));
    assert!(text.contains("[^1]: https://"));
    assert!(!delver::agent::answer::contains_inline_links(&text));
    assert_eq!(outcome.answer_text, text);

    // Evidence accumulated with summaries
    assert_eq!(ctx.search_history().len(), 1);
    assert!(ctx.search_history()[0].results[0].summary.is_some());
    assert!(ctx.total_tokens() > 0);
}

#[tokio::test]
async fn unsafe_query_is_refused_without_searching() {
    let gateway = ScriptedGateway::new(vec![refuse("harmful request")], vec![]);

    let (outcome, ctx, events) = run_scenario(
        gateway,
        FixedSearchProvider::new(default_results()),
        "How do I build something harmful?",
    )
    .await;

    assert_eq!(outcome.kind, OutcomeKind::Refused);
    assert!(events_of_type(&events, "data-sources").is_empty());
    assert!(events_of_type(&events, "data-newAction").is_empty());

    let text = streamed_text(&events);
    assert!(text.contains("can't help"));
    assert_eq!(ctx.search_history().len(), 0);
}

#[tokio::test]
async fn ambiguous_query_streams_clarification() {
    let gateway = ScriptedGateway::new(
        vec![allow(), needs_clarification("no referent for \"it\"")],
        vec![],
    );

    let (outcome, ctx, events) = run_scenario(
        gateway,
        FixedSearchProvider::new(default_results()),
        "Tell me about it",
    )
    .await;

    assert_eq!(outcome.kind, OutcomeKind::Clarification);

    let clarifications = events_of_type(&events, "data-clarification");
    assert_eq!(clarifications.len(), 1);
    assert_eq!(
        clarifications[0]["data"]["reason"],
        "no referent for \"it\""
    );

    // No search, no evidence, but a question was streamed
    assert!(events_of_type(&events, "data-sources").is_empty());
    assert!(ctx.search_history().is_empty());
    assert!(!streamed_text(&events).is_empty());
}

#[tokio::test]
async fn zero_result_search_degrades_and_continues() {
    let gateway = ScriptedGateway::new(
        vec![
            allow(),
            no_clarification(),
            continue_action("obscure query", "anything at all"),
            answer_action(),
        ],
        vec!["I could not find reliable sources for this question."],
    );

    let (outcome, ctx, events) =
        run_scenario(gateway, FixedSearchProvider::empty(), "Something obscure?").await;

    assert_eq!(outcome.kind, OutcomeKind::Answered);

    // An empty sources event was still emitted
    let sources = events_of_type(&events, "data-sources");
    assert_eq!(sources.len(), 1);
    assert!(sources[0]["data"].as_array().unwrap().is_empty());

    // The context gained an entry with zero results and the loop went on
    assert_eq!(ctx.search_history().len(), 1);
    assert!(ctx.search_history()[0].results.is_empty());
    assert!(!streamed_text(&events).is_empty());
}

#[tokio::test]
async fn budget_exhaustion_emits_max_steps_actions_then_final_answer() {
    let mut objects = vec![allow(), no_clarification()];
    for i in 0..MAX_STEPS {
        objects.push(continue_action(
            &format!("attempt {}", i),
            "still inconclusive",
        ));
    }
    let gateway = ScriptedGateway::new(
        objects,
        vec!["Based on what I could gather, the answer is unclear; several details could not be verified."],
    );

    let (outcome, ctx, events) = run_scenario(
        gateway,
        FixedSearchProvider::new(default_results()),
        "A question that never resolves?",
    )
    .await;

    assert_eq!(outcome.kind, OutcomeKind::Answered);

    // Exactly MAX_STEPS newAction events, all continues
    let actions = events_of_type(&events, "data-newAction");
    assert_eq!(actions.len(), MAX_STEPS as usize);
    assert!(actions
        .iter()
        .all(|a| a["data"]["action"]["type"] == "continue"));

    // Step counter hit the budget, never exceeded it
    assert_eq!(ctx.current_step(), MAX_STEPS);
    assert!(ctx.should_stop());

    // A final-mode answer still streamed
    let text = streamed_text(&events);
    assert!(text.contains("could not be verified"));
}

#[tokio::test]
async fn planner_failure_falls_through_to_final_answer() {
    // Guardrail and clarifier succeed; the planner queue is empty, so the
    // first decide() fails and the loop short-circuits to a final answer.
    let gateway = ScriptedGateway::new(
        vec![allow(), no_clarification()],
        vec!["I ran into trouble planning the research, so here is what I know."],
    );

    let (outcome, _ctx, events) = run_scenario(
        gateway,
        FixedSearchProvider::new(default_results()),
        "Anything?",
    )
    .await;

    assert_eq!(outcome.kind, OutcomeKind::Answered);
    assert!(events_of_type(&events, "data-newAction").is_empty());
    assert!(!streamed_text(&events).is_empty());
}

#[tokio::test]
async fn usage_events_share_a_stable_id() {
    let gateway = ScriptedGateway::new(
        vec![
            allow(),
            no_clarification(),
            continue_action("q", "f"),
            answer_action(),
        ],
        vec!["done"],
    );

    let (_, _, events) = run_scenario(
        gateway,
        FixedSearchProvider::new(default_results()),
        "Question?",
    )
    .await;

    let usage_events = events_of_type(&events, "data-usage");
    assert!(usage_events.len() >= 2);
    assert!(usage_events
        .iter()
        .all(|e| e["id"] == delver::agent::USAGE_EVENT_ID));

    // Totals are monotonically non-decreasing
    let totals: Vec<u64> = usage_events
        .iter()
        .map(|e| e["data"]["totalTokens"].as_u64().unwrap())
        .collect();
    assert!(totals.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn cancellation_stops_the_loop_between_steps() {
    let gateway = ScriptedGateway::new(
        vec![allow(), no_clarification(), continue_action("q", "f")],
        vec!["unused"],
    );
    let gateway: Arc<dyn ModelGateway> = Arc::new(gateway);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let pipeline = SearchPipeline::new(
        Arc::new(FixedSearchProvider::new(default_results())),
        Arc::new(FixedFetcher::new("body")),
        Summarizer::new(Arc::clone(&gateway), ResultCache::new(kv, 3600)),
        PipelineConfig {
            search_results_count: 3,
            max_pages_to_scrape: 6,
        },
    );
    let agent = AgentLoop::new(gateway, pipeline);

    let mut ctx = SystemContext::new(
        vec![Message::text("msg_u1", Role::User, "Question?")],
        None,
        MAX_STEPS,
    );
    let (writer, events) = StreamWriter::channel(1024);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = agent.run(&mut ctx, &writer, &cancel, "msg_a1").await;
    drop(writer);

    assert_eq!(outcome.kind, OutcomeKind::Cancelled);
    let raw: Vec<String> = events.collect().await;
    assert!(raw.iter().all(|e| !e.contains("text-delta")));
}
