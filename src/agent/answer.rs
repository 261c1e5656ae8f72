//! Answerer stage
//!
//! Streams the final markdown answer with footnote citations. The raw LLM
//! delta stream passes through two transformers before reaching the client:
//!
//! 1. The markdown joiner buffers deltas across partial-syntax boundaries,
//!    so a bold span split as "**bo" + "ld**" reaches the client as one
//!    unit. Concatenated output always equals the input, and no emitted
//!    chunk ends inside a markdown control token.
//! 2. The smoother re-chunks the joined text by words with a small
//!    inter-chunk delay, so the client renders an even cadence.

use chrono::Utc;
use futures::StreamExt;
use regex::Regex;
use std::sync::{Arc, OnceLock};

use super::context::SystemContext;
use super::protocol::{StreamEvent, StreamWriter};
use crate::error::Result;
use crate::gateway::{GenerateRequest, ModelGateway, ModelRole, StreamChunk};

// ============================================================================
// Markdown joiner
// ============================================================================

/// Buffers text deltas so no emitted chunk ends inside a markdown control
/// token (`**`, `[`, `](`, backtick, `[^`, `]:`) and spans like bold, code,
/// links, and footnote markers emit whole.
#[derive(Debug, Default)]
pub struct MarkdownJoiner {
    buffer: String,
}

impl MarkdownJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta; returns the prefix that is now safe to emit.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.buffer.push_str(delta);
        let safe = safe_emit_len(&self.buffer);
        if safe == 0 {
            None
        } else {
            Some(self.buffer.drain(..safe).collect())
        }
    }

    /// Flush whatever is still buffered (stream ended; an unclosed span is
    /// emitted as-is).
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Byte length of the longest prefix that can be emitted without ending
/// inside a control token or splitting an open span.
fn safe_emit_len(s: &str) -> usize {
    let chars: Vec<(usize, char)> = s.char_indices().collect();
    let n = chars.len();
    let mut k = 0;

    while k < n {
        let (byte_idx, c) = chars[k];
        match c {
            '`' => {
                // Code span: hold from the opening backtick until it closes
                match chars[k + 1..].iter().position(|&(_, ch)| ch == '`') {
                    Some(off) => k += off + 2,
                    None => return byte_idx,
                }
            }
            '*' => {
                if k + 1 < n && chars[k + 1].1 == '*' {
                    // Bold span: hold until the closing **
                    let mut j = k + 2;
                    loop {
                        if j + 1 >= n {
                            return byte_idx;
                        }
                        if chars[j].1 == '*' && chars[j + 1].1 == '*' {
                            break;
                        }
                        j += 1;
                    }
                    k = j + 2;
                } else if k + 1 == n {
                    // Trailing lone '*' could be the first half of '**'
                    return byte_idx;
                } else {
                    k += 1;
                }
            }
            '[' => {
                // Link, footnote reference, or footnote definition
                match chars[k + 1..].iter().position(|&(_, ch)| ch == ']') {
                    None => return byte_idx,
                    Some(off) => {
                        let close = k + 1 + off;
                        if close + 1 == n {
                            // Cannot tell yet whether `](` or `]:` follows
                            return byte_idx;
                        }
                        match chars[close + 1].1 {
                            '(' => {
                                // Inline link target: hold until ')'
                                match chars[close + 2..].iter().position(|&(_, ch)| ch == ')') {
                                    Some(off2) => k = close + 2 + off2 + 1,
                                    None => return byte_idx,
                                }
                            }
                            ':' => k = close + 2,
                            _ => k = close + 1,
                        }
                    }
                }
            }
            ']' => {
                if k + 1 == n {
                    // Could begin `](` or `]:`
                    return byte_idx;
                }
                k += 1;
            }
            _ => k += 1,
        }
    }

    s.len()
}

// ============================================================================
// Smoother
// ============================================================================

/// Re-chunks joined text into word groups with a small delay between
/// emissions.
#[derive(Debug, Clone)]
pub struct Smoother {
    pub words_per_chunk: usize,
    pub delay_ms: u64,
}

impl Default for Smoother {
    fn default() -> Self {
        Self {
            words_per_chunk: 3,
            delay_ms: 15,
        }
    }
}

/// Split into word units, each carrying its trailing whitespace, so the
/// concatenation of all units equals the input.
fn word_units(text: &str) -> Vec<&str> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut in_whitespace = false;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_whitespace = true;
        } else if in_whitespace {
            units.push(&text[start..i]);
            start = i;
            in_whitespace = false;
        }
    }
    if start < text.len() {
        units.push(&text[start..]);
    }
    units
}

impl Smoother {
    /// Emit `text` as word-chunked deltas. Returns false once the client is
    /// gone.
    pub async fn emit(&self, writer: &StreamWriter, text_id: &str, text: &str) -> bool {
        let units = word_units(text);
        for (i, group) in units.chunks(self.words_per_chunk.max(1)).enumerate() {
            if i > 0 && self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            let delta: String = group.concat();
            let ok = writer
                .write(&StreamEvent::TextDelta {
                    id: text_id.to_string(),
                    delta,
                })
                .await;
            if !ok {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Answerer
// ============================================================================

const ANSWER_STYLE_GUIDE: &str = "You write grounded research answers in markdown.

Citation rules:
- Cite every externally sourced claim with a footnote marker like [^1].
- End the answer with the footnote definitions, one per line: [^1]: https://example.com
- Never use inline links of the form [text](url). Footnotes are the only \
way URLs may appear.
- Use **bold** sparingly for key facts; prefer plain prose over lists \
unless the user asked for a list.
- Preserve dates and statistics exactly as the evidence states them. Do not \
invent information that is not in the evidence.";

/// Streams the final answer through the joiner and smoother.
pub struct Answerer {
    gateway: Arc<dyn ModelGateway>,
    smoother: Smoother,
}

impl Answerer {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            gateway,
            smoother: Smoother::default(),
        }
    }

    pub fn with_smoother(mut self, smoother: Smoother) -> Self {
        self.smoother = smoother;
        self
    }

    /// Stream the final answer. Returns the full answer text.
    pub async fn stream_answer(
        &self,
        ctx: &mut SystemContext,
        is_final: bool,
        writer: &StreamWriter,
        text_id: &str,
    ) -> Result<String> {
        let request = GenerateRequest::new(ModelRole::Answerer, build_answer_prompt(ctx, is_final))
            .with_system(ANSWER_STYLE_GUIDE.to_string())
            .with_trace_id(crate::gateway::new_trace_id());

        let mut stream = self.gateway.stream_text(request).await?;
        let mut joiner = MarkdownJoiner::new();
        let mut full_text = String::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta(delta) => {
                    full_text.push_str(&delta);
                    if let Some(ready) = joiner.push(&delta) {
                        if !self.smoother.emit(writer, text_id, &ready).await {
                            break;
                        }
                    }
                }
                StreamChunk::Done(usage) => {
                    ctx.report_usage(if is_final { "answerer-final" } else { "answerer" }, usage);
                }
            }
        }

        if let Some(rest) = joiner.finish() {
            self.smoother.emit(writer, text_id, &rest).await;
        }

        if contains_inline_links(&full_text) {
            tracing::warn!("Answer contains inline links despite footnote-only style");
        }

        Ok(full_text)
    }

    /// Stream a fixed text (refusal or clarification question) through the
    /// smoother, without an LLM call.
    pub async fn stream_static(&self, writer: &StreamWriter, text_id: &str, text: &str) -> bool {
        self.smoother.emit(writer, text_id, text).await
    }
}

/// True when the text carries an inline `[text](url)` link.
pub fn contains_inline_links(text: &str) -> bool {
    static INLINE_LINK: OnceLock<Regex> = OnceLock::new();
    let re = INLINE_LINK.get_or_init(|| Regex::new(r"\[[^\]]+\]\(").expect("valid regex"));
    re.is_match(text)
}

fn build_answer_prompt(ctx: &SystemContext, is_final: bool) -> String {
    let mut prompt = format!("Current date: {}\n\n", Utc::now().format("%A, %B %d, %Y"));

    let location = ctx.user_location_context();
    if !location.is_empty() {
        prompt.push_str(&location);
        prompt.push_str("\n\n");
    }

    prompt.push_str(&format!("Initial question: {}\n\n", ctx.initial_question()));
    prompt.push_str(&format!(
        "<conversation>\n{}\n</conversation>\n\n",
        ctx.conversation_history()
    ));
    prompt.push_str(&format!(
        "Latest user message: {}\n\n",
        ctx.latest_user_message()
    ));
    prompt.push_str(&format!(
        "<evidence>\n{}\n</evidence>\n\n",
        ctx.search_history_text()
    ));

    if is_final {
        prompt.push_str(
            "The research budget is exhausted. Answer with the evidence \
             gathered so far, best effort, and explicitly acknowledge what \
             could not be verified.",
        );
    } else {
        prompt.push_str("Answer the latest user message using the evidence.");
    }

    prompt
}
