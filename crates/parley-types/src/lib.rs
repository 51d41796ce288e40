//! Shared types and constants for the Parley speech mediation layer.
//!
//! This crate holds the vocabulary every other Parley crate agrees on:
//! conversation roles, engine lifecycle states, history entries, and the
//! external event shapes delivered to browser/voice clients.
//!
//! No crate in the workspace depends on anything *except* `parley-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

pub mod event;

pub use event::{AudioFormat, ExternalEvent, ToolLogSubtype};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal payload the remote model emits inside a text fragment when the
/// user barges in on an assistant response.
pub const INTERRUPTED_MARKER: &str = r#"{ "interrupted" : true }"#;

/// Returns `true` if the fragment carries the barge-in marker.
pub fn is_interrupted(text: &str) -> bool {
    text.contains(INTERRUPTED_MARKER)
}

/// Conversation role attached to content blocks and history entries.
///
/// Serialized in the upper-case form the remote protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Returns the protocol label (`USER`, `ASSISTANT`, ...).
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
            Self::System => "SYSTEM",
            Self::Tool => "TOOL",
        }
    }

    /// Returns the lower-case speaker label used in client-facing events.
    pub fn speaker(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    /// Whether transcript text for this role is part of conversation history.
    pub fn is_conversational(self) -> bool {
        matches!(self, Self::User | Self::Assistant)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl std::str::FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "ASSISTANT" => Ok(Self::Assistant),
            "SYSTEM" => Ok(Self::System),
            "TOOL" => Ok(Self::Tool),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown role string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct ParseRoleError(pub String);

/// Lifecycle of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Constructed, handshake queued, remote channel not yet open.
    Created,
    /// Remote channel open and exchanging frames.
    Streaming,
    /// `close()` has begun; queued frames are flushing.
    Draining,
    /// Remote channel torn down.
    Closed,
    /// An unexpected protocol or transport error ended the remote channel.
    Errored,
}

impl Lifecycle {
    /// Whether the engine can no longer exchange frames with the remote model.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// One closed, immutable piece of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Ordinal of the turn this entry was completed in.
    pub ordinal: u64,
    pub role: Role,
    pub text: String,
    pub completed_at: DateTime<Utc>,
}
