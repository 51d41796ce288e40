//! Seam for the content filter applied to assistant transcript text, and
//! the per-session record of what it blocked.

use chrono::{DateTime, Utc};
use parley_types::Role;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComplianceVerdict {
    pub block: bool,
    /// Text delivered in place of a blocked fragment. `None` delivers
    /// nothing.
    pub replacement_text: Option<String>,
    /// Names of the rules that matched, for the audit trail.
    pub matched_rules: Vec<String>,
}

impl ComplianceVerdict {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn block_with(replacement: impl Into<String>) -> Self {
        Self {
            block: true,
            replacement_text: Some(replacement.into()),
            matched_rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<String>) -> Self {
        self.matched_rules = rules;
        self
    }
}

/// Checks a transcript fragment before it reaches the client.
///
/// The engine only submits assistant text. A blocking verdict also mutes
/// assistant audio until the user speaks again.
pub trait ComplianceFilter: Send + Sync + 'static {
    fn check(&self, text: &str, role: Role) -> ComplianceVerdict;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceAction {
    /// The fragment was dropped.
    Blocked,
    /// The fragment was replaced with the filter's replacement text.
    Rewritten,
}

/// One blocked assistant fragment. The original text is kept only as a
/// SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoncomplianceEvent {
    pub timestamp: DateTime<Utc>,
    pub matched_rules: Vec<String>,
    pub action_taken: ComplianceAction,
    pub original_text_hash: String,
}

impl NoncomplianceEvent {
    pub fn new(original_text: &str, verdict: &ComplianceVerdict) -> Self {
        let action_taken = if verdict.replacement_text.is_some() {
            ComplianceAction::Rewritten
        } else {
            ComplianceAction::Blocked
        };
        Self {
            timestamp: Utc::now(),
            matched_rules: verdict.matched_rules.clone(),
            action_taken,
            original_text_hash: hex::encode(Sha256::digest(original_text.as_bytes())),
        }
    }
}
