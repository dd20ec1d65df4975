//! Post-call summary generation.
//!
//! Runs off the real-time path, usually after the caller hangs up. Any
//! failure degrades to [`CallSummary::Unavailable`]; a missing summary never
//! fails the call.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::backend::LanguageModelBackend;
use crate::conversation::{BoundaryPolicy, ConversationContext, Role, Turn};

const SUMMARY_PROMPT: &str = r#"Based on the conversation history, please provide:
1. A brief summary of the call (2-3 sentences)
2. Overall sentiment of the customer (positive, neutral, or negative)
3. 2-3 action items or next steps

Respond with JSON only, in this format:
{"sentiment": "", "summary": "", "action_items": []}"#;

/// Upper bound on raw text kept when the reply is not valid JSON.
const MAX_FALLBACK_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Unknown,
}

impl<'de> Deserialize<'de> for Sentiment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "positive" => Self::Positive,
            "neutral" => Self::Neutral,
            "negative" => Self::Negative,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Neutral => write!(f, "neutral"),
            Self::Negative => write!(f, "negative"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub sentiment: Sentiment,
    pub summary: String,
    #[serde(default)]
    pub action_items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CallSummary {
    Available(Summary),
    Unavailable,
}

impl CallSummary {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

impl fmt::Display for CallSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "Summary unavailable"),
            Self::Available(s) => {
                writeln!(f, "Sentiment: {}", s.sentiment)?;
                writeln!(f, "Summary: {}", s.summary)?;
                for item in &s.action_items {
                    writeln!(f, "- {item}")?;
                }
                Ok(())
            }
        }
    }
}

/// Ask the backend for a structured digest of the conversation.
pub async fn generate_summary(
    backend: &dyn LanguageModelBackend,
    context: &ConversationContext,
    system_prompt: &str,
    boundary: &BoundaryPolicy,
    timeout: Duration,
) -> CallSummary {
    let t_start = Instant::now();

    let mut messages = context.snapshot();
    if messages.first().map(|t| t.role) != Some(Role::User) {
        messages.insert(0, Turn::new(Role::User, boundary.opening.clone()));
    }
    messages.push(Turn::new(Role::User, SUMMARY_PROMPT));

    let raw = match tokio::time::timeout(timeout, backend.generate(&messages, system_prompt)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            warn!("Error generating summary: {e}");
            return CallSummary::Unavailable;
        }
        Err(_) => {
            warn!("Summary request timed out after {timeout:?}");
            return CallSummary::Unavailable;
        }
    };

    let summary = parse_summary(&raw);
    info!(
        "Call summary generated in {:.0}ms (available={})",
        t_start.elapsed().as_secs_f64() * 1000.0,
        summary.is_available()
    );
    summary
}

/// Parse the model's reply. The JSON object may be wrapped in prose or a
/// code fence; if no object parses, the raw text is kept as the summary.
pub fn parse_summary(raw: &str) -> CallSummary {
    let raw = raw.trim();
    if raw.is_empty() {
        return CallSummary::Unavailable;
    }

    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            match serde_json::from_str::<Summary>(&raw[start..=end]) {
                Ok(summary) => return CallSummary::Available(summary),
                Err(e) => warn!("Summary JSON did not parse: {e}"),
            }
        }
    }

    CallSummary::Available(Summary {
        sentiment: Sentiment::Unknown,
        summary: raw.chars().take(MAX_FALLBACK_CHARS).collect(),
        action_items: Vec::new(),
    })
}
