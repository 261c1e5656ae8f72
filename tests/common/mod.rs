//! Scripted collaborators for loop-level tests: a gateway that replays
//! queued structured decisions, a search provider and fetcher with fixed
//! results, and an in-memory key-value store.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use delver::error::{Error, Result};
use delver::gateway::{
    GenerateRequest, ModelGateway, ObjectResponse, StreamChunk, TextResponse, TextStream,
    TokenUsage,
};
use delver::kv::KvStore;
use delver::search::{FetchedPage, OrganicResult, PageFetcher, SearchProvider};

fn usage() -> TokenUsage {
    TokenUsage {
        prompt_tokens: 100,
        completion_tokens: 10,
    }
}

/// Gateway that replays scripted responses.
///
/// Structured calls (guardrail, clarifier, planner) pop from `objects` in
/// call order. Text calls return a fixed summary string; streaming calls
/// replay `stream_deltas`.
pub struct ScriptedGateway {
    objects: Mutex<VecDeque<Value>>,
    pub text_response: String,
    pub stream_deltas: Vec<String>,
}

impl ScriptedGateway {
    pub fn new(objects: Vec<Value>, stream_deltas: Vec<&str>) -> Self {
        Self {
            objects: Mutex::new(objects.into_iter().collect()),
            text_response: "Scripted auxiliary text.".to_string(),
            stream_deltas: stream_deltas.into_iter().map(String::from).collect(),
        }
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate_text(&self, _request: GenerateRequest) -> Result<TextResponse> {
        Ok(TextResponse {
            text: self.text_response.clone(),
            usage: usage(),
        })
    }

    async fn generate_object(
        &self,
        _request: GenerateRequest,
        _schema: Value,
    ) -> Result<ObjectResponse> {
        let value = self
            .objects
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Gateway("no scripted object left".into()))?;
        Ok(ObjectResponse {
            value,
            usage: usage(),
        })
    }

    async fn stream_text(&self, _request: GenerateRequest) -> Result<TextStream> {
        let deltas = self.stream_deltas.clone();
        let stream: TextStream = Box::pin(async_stream::try_stream! {
            for delta in deltas {
                yield StreamChunk::Delta(delta);
            }
            yield StreamChunk::Done(usage());
        });
        Ok(stream)
    }
}

/// Search provider returning the same results for every query, logging the
/// queries it saw.
pub struct FixedSearchProvider {
    pub results: Vec<OrganicResult>,
    pub queries: Mutex<Vec<String>>,
}

impl FixedSearchProvider {
    pub fn new(results: Vec<OrganicResult>) -> Self {
        Self {
            results,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![])
    }
}

pub fn organic(title: &str, link: &str, snippet: &str) -> OrganicResult {
    serde_json::from_value(serde_json::json!({
        "title": title,
        "link": link,
        "snippet": snippet,
    }))
    .unwrap()
}

#[async_trait]
impl SearchProvider for FixedSearchProvider {
    async fn search(&self, query: &str, num: u8) -> Result<Vec<OrganicResult>> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.results.iter().take(num as usize).cloned().collect())
    }
}

/// Fetcher returning one fixed body for every URL.
pub struct FixedFetcher {
    pub body: String,
}

impl FixedFetcher {
    pub fn new(body: &str) -> Self {
        Self {
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl PageFetcher for FixedFetcher {
    async fn fetch(&self, urls: &[String]) -> Result<Vec<FetchedPage>> {
        Ok(urls
            .iter()
            .map(|url| FetchedPage {
                url: url.clone(),
                body: self.body.clone(),
            })
            .collect())
    }
}

/// In-memory key-value store with TTL semantics.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                inner.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.inner.lock().unwrap().insert(
            key.to_string(),
            (
                value.to_string(),
                Some(Instant::now() + Duration::from_secs(ttl_secs)),
            ),
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let expired = matches!(inner.get(key), Some((_, Some(d))) if *d <= Instant::now());
        if expired {
            inner.remove(key);
        }
        let entry = inner
            .entry(key.to_string())
            .or_insert(("0".to_string(), None));
        let next = entry.0.parse::<i64>().unwrap_or(0) + 1;
        entry.0 = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(key) {
            entry.1 = Some(Instant::now() + Duration::from_secs(ttl_secs));
        }
        Ok(())
    }
}

// ============================================================================
// Scripted planner decisions
// ============================================================================

pub fn allow() -> Value {
    serde_json::json!({ "decision": "allow" })
}

pub fn refuse(reason: &str) -> Value {
    serde_json::json!({ "decision": "refuse", "reason": reason })
}

pub fn no_clarification() -> Value {
    serde_json::json!({ "needs_clarification": false })
}

pub fn needs_clarification(reason: &str) -> Value {
    serde_json::json!({ "needs_clarification": true, "reason": reason })
}

pub fn continue_action(query: &str, feedback: &str) -> Value {
    serde_json::json!({
        "type": "continue",
        "title": "Searching",
        "reasoning": "More evidence needed",
        "query": query,
        "feedback": feedback,
    })
}

pub fn answer_action() -> Value {
    serde_json::json!({
        "type": "answer",
        "title": "Answering",
        "reasoning": "Evidence suffices",
    })
}
