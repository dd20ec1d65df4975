//! Completion engine: conversation state + LLM call + reply slicing.
//!
//! A reply is cut into partial-response units at pause markers (`•` by
//! default, which the system prompt asks the model to emit after every
//! sentence). Replies without any marker fall back to sentence-ending
//! punctuation followed by whitespace. Units are contiguous slices of the
//! reply, so joining them gives back the reply byte for byte.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::LanguageModelBackend;
use crate::config::LlmConfig;
use crate::conversation::{BoundaryPolicy, ConversationContext, Role};
use crate::error::{BackendError, PipelineError, Result};
use crate::summary::{self, CallSummary};

/// One ordered slice of a reply, synthesized independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResponseUnit {
    pub sequence_index: u64,
    pub text: String,
    pub interaction_id: u64,
}

/// Lazy iterator over the units of one reply, in index order.
#[derive(Debug, Clone)]
pub struct ResponseUnits {
    reply: String,
    cursor: usize,
    next_index: u64,
    interaction_id: u64,
    marker: char,
    by_marker: bool,
}

impl ResponseUnits {
    pub fn new(reply: impl Into<String>, interaction_id: u64, marker: char) -> Self {
        let reply = reply.into();
        let by_marker = reply.contains(marker);
        Self {
            reply,
            cursor: 0,
            next_index: 0,
            interaction_id,
            marker,
            by_marker,
        }
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Byte offset just past the next boundary at or after `cursor`.
    fn next_boundary(&self) -> usize {
        let rest = &self.reply[self.cursor..];
        let found = if self.by_marker {
            rest.find(self.marker).map(|pos| pos + self.marker.len_utf8())
        } else {
            sentence_end(rest)
        };
        found.map_or(self.reply.len(), |offset| self.cursor + offset)
    }
}

impl Iterator for ResponseUnits {
    type Item = PartialResponseUnit;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.reply.len() {
            return None;
        }

        let mut end = self.next_boundary();
        // A whitespace-only tail belongs to the last unit.
        if self.reply[end..].trim().is_empty() {
            end = self.reply.len();
        }

        let unit = PartialResponseUnit {
            sequence_index: self.next_index,
            text: self.reply[self.cursor..end].to_string(),
            interaction_id: self.interaction_id,
        };
        self.cursor = end;
        self.next_index += 1;
        Some(unit)
    }
}

/// Offset just past the first `.`, `!` or `?` that is followed by whitespace.
fn sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(i + c.len_utf8());
                }
            }
        }
    }
    None
}

/// Text that is actually spoken for a unit: markers removed, trimmed.
pub fn speakable_text(text: &str, marker: char) -> String {
    text.chars()
        .filter(|&c| c != marker)
        .collect::<String>()
        .trim()
        .to_string()
}

pub struct CompletionEngine {
    context: ConversationContext,
    backend: Arc<dyn LanguageModelBackend>,
    system_prompt: String,
    boundary: BoundaryPolicy,
    pause_marker: char,
    timeout: Duration,
}

impl CompletionEngine {
    pub fn new(backend: Arc<dyn LanguageModelBackend>, config: &LlmConfig, pause_marker: char) -> Self {
        Self {
            context: ConversationContext::new(),
            backend,
            system_prompt: config.system_prompt.clone(),
            boundary: BoundaryPolicy {
                opening: config.opening_turn.clone(),
                closing: config.closing_turn.clone(),
            },
            pause_marker,
            timeout: config.timeout(),
        }
    }

    /// Tag the system prompt with the call identifier so the model can
    /// reference it.
    pub fn set_call_id(&mut self, call_id: &str) {
        self.system_prompt.push_str(&format!(" callSid: {call_id}"));
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    /// Prime the log with a turn, e.g. a greeting already played to the
    /// caller. The role is given by name.
    pub fn seed_turn(&mut self, role: &str, content: &str) -> Result<()> {
        self.context.append_raw(role, content)
    }

    /// Run one completion turn.
    ///
    /// The user turn is kept even if the backend fails, so a retry sees the
    /// full history. On success the reply is stored as an assistant turn and
    /// returned as ordered units.
    pub async fn complete(&mut self, user_text: &str, interaction_id: u64) -> Result<ResponseUnits> {
        self.context.append(Role::User, user_text);
        let messages = self.context.outbound_messages(&self.boundary);

        debug!(
            "Interaction {interaction_id}: requesting completion from {} ({} messages)",
            self.backend.name(),
            messages.len()
        );

        let reply = match tokio::time::timeout(
            self.timeout,
            self.backend.generate(&messages, &self.system_prompt),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(cause)) => {
                warn!("Interaction {interaction_id}: completion failed: {cause}");
                return Err(PipelineError::CompletionFailed { cause });
            }
            Err(_) => {
                warn!(
                    "Interaction {interaction_id}: completion timed out after {:?}",
                    self.timeout
                );
                return Err(PipelineError::CompletionFailed {
                    cause: BackendError::Timeout,
                });
            }
        };

        info!("Generated content: {reply}");
        self.context.append(Role::Assistant, reply.clone());
        info!("{} -> context length: {}", self.backend.name(), self.context.len());

        Ok(ResponseUnits::new(reply, interaction_id, self.pause_marker))
    }

    /// Best-effort post-call digest. Never fails; see [`summary`].
    pub async fn generate_summary(&self, timeout: Duration) -> CallSummary {
        summary::generate_summary(
            self.backend.as_ref(),
            &self.context,
            &self.system_prompt,
            &self.boundary,
            timeout,
        )
        .await
    }
}
