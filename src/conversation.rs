//! Conversation turn log.
//!
//! The log is append-only. Outbound message lists are built from a snapshot
//! so that boundary turns required by chat APIs never leak into the stored
//! history.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

impl FromStr for Role {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(PipelineError::InvalidTurnRole(s.to_string())),
        }
    }
}

/// One entry of the conversation, also the wire shape sent to backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Synthetic turns inserted when the stored log does not start and end
/// with a user turn.
#[derive(Debug, Clone)]
pub struct BoundaryPolicy {
    pub opening: String,
    pub closing: String,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self {
            opening: "Hello.".into(),
            closing: "Please continue.".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(Turn::new(role, content));
    }

    /// Append a turn whose role arrives as a string (e.g. from a replayed
    /// transcript).
    pub fn append_raw(&mut self, role: &str, content: impl Into<String>) -> Result<(), PipelineError> {
        let role = role.parse()?;
        self.append(role, content);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn assistant_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::Assistant).count()
    }

    /// Snapshot with boundary turns applied so the sequence begins and ends
    /// with a user turn. An empty log yields just the opening turn.
    pub fn outbound_messages(&self, policy: &BoundaryPolicy) -> Vec<Turn> {
        let mut messages = self.snapshot();

        if messages.first().map(|t| t.role) != Some(Role::User) {
            messages.insert(0, Turn::new(Role::User, policy.opening.clone()));
        }
        if messages.last().map(|t| t.role) != Some(Role::User) {
            messages.push(Turn::new(Role::User, policy.closing.clone()));
        }

        messages
    }
}
