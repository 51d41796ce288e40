//! Phrase-list content filter for assistant transcript text.

use std::sync::Arc;

use parley_engine::{ComplianceFilter, ComplianceVerdict};
use parley_types::Role;

use crate::config::ComplianceConfig;

/// Blocks any assistant fragment containing one of the configured phrases,
/// compared case-insensitively.
#[derive(Debug, Clone)]
pub struct PhraseListFilter {
    phrases: Vec<String>,
    replacement_text: String,
}

impl PhraseListFilter {
    pub fn new(phrases: &[String], replacement_text: impl Into<String>) -> Self {
        Self {
            phrases: phrases
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            replacement_text: replacement_text.into(),
        }
    }

    /// Returns `None` when no phrases are configured.
    pub fn from_config(config: &ComplianceConfig) -> Option<Arc<dyn ComplianceFilter>> {
        let filter = Self::new(&config.blocked_phrases, config.replacement_text.clone());
        if filter.phrases.is_empty() {
            return None;
        }
        tracing::info!(phrases = filter.phrases.len(), "compliance filter enabled");
        Some(Arc::new(filter))
    }
}

impl ComplianceFilter for PhraseListFilter {
    fn check(&self, text: &str, role: Role) -> ComplianceVerdict {
        if role != Role::Assistant {
            return ComplianceVerdict::allow();
        }
        let lowered = text.to_lowercase();
        let matched: Vec<String> = self
            .phrases
            .iter()
            .filter(|p| lowered.contains(p.as_str()))
            .cloned()
            .collect();
        if matched.is_empty() {
            return ComplianceVerdict::allow();
        }
        tracing::warn!(rules = ?matched, "assistant text blocked by compliance filter");
        ComplianceVerdict::block_with(self.replacement_text.clone()).with_rules(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively() {
        let filter = PhraseListFilter::new(&["Off-Label".to_string()], "Let's stay on label.");
        let verdict = filter.check("It works great for OFF-LABEL use", Role::Assistant);
        assert!(verdict.block);
        assert_eq!(verdict.replacement_text.as_deref(), Some("Let's stay on label."));
        assert_eq!(verdict.matched_rules, ["off-label"]);
        assert!(!filter.check("Approved indications only", Role::Assistant).block);
    }

    #[test]
    fn user_text_is_never_blocked() {
        let filter = PhraseListFilter::new(&["off-label".to_string()], "no");
        assert!(!filter.check("what about off-label?", Role::User).block);
    }

    #[test]
    fn empty_phrase_list_disables_the_filter() {
        let config = ComplianceConfig {
            blocked_phrases: vec!["  ".to_string()],
            ..ComplianceConfig::default()
        };
        assert!(PhraseListFilter::from_config(&config).is_none());
    }
}
