//! Turn accumulation, history replay, and checkpointing.

use std::sync::Arc;

use chrono::Utc;
use parley_protocol::{
    build_content_end, build_content_start, build_text_input, new_content_name, ContentKind,
    MediaConfig, OutboundFrame,
};
use parley_types::{is_interrupted, HistoryEntry, Role};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::SessionStore;

/// Per-engine conversation state: the open turn's text by role, and every
/// closed history entry in chronological order.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    user_text: String,
    assistant_text: String,
    entries: Vec<HistoryEntry>,
    ordinal: u64,
    restored: bool,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text fragment to the accumulator for `role`.
    ///
    /// Returns `false` when the fragment was not accumulated: it carried the
    /// barge-in marker, or `role` is not part of the conversation.
    pub fn push_fragment(&mut self, role: Role, text: &str) -> bool {
        if is_interrupted(text) {
            return false;
        }
        match role {
            Role::User => self.user_text.push_str(text),
            Role::Assistant => self.assistant_text.push_str(text),
            Role::System | Role::Tool => return false,
        }
        true
    }

    /// Closes the current turn and returns the entries it produced (user
    /// first). The ordinal advances even when nothing was said.
    pub fn complete_turn(&mut self) -> Vec<HistoryEntry> {
        let completed_at = Utc::now();
        let ordinal = self.ordinal;
        let mut closed = Vec::new();
        for (role, text) in [
            (Role::User, std::mem::take(&mut self.user_text)),
            (Role::Assistant, std::mem::take(&mut self.assistant_text)),
        ] {
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            closed.push(HistoryEntry {
                ordinal,
                role,
                text: text.to_string(),
                completed_at,
            });
        }
        self.entries.extend(closed.iter().cloned());
        self.ordinal += 1;
        closed
    }

    /// Replaces in-memory history with entries recovered from the store,
    /// already in chronological order.
    pub fn restore(&mut self, entries: Vec<HistoryEntry>) {
        self.ordinal = entries
            .iter()
            .map(|e| e.ordinal + 1)
            .max()
            .unwrap_or(0)
            .max(self.ordinal);
        self.entries = entries;
        self.restored = true;
    }

    /// Whether the next turn needs history replayed ahead of it.
    pub fn has_context(&self) -> bool {
        !self.entries.is_empty() || self.restored
    }

    /// One `contentStart(TEXT) → textInput → contentEnd` triple per entry,
    /// oldest first, each under a fresh content name.
    pub fn replay_frames(&self, prompt_name: &str) -> Vec<OutboundFrame> {
        let mut frames = Vec::with_capacity(self.entries.len() * 3);
        for entry in &self.entries {
            let content_name = new_content_name();
            frames.push(build_content_start(
                prompt_name,
                &content_name,
                ContentKind::Text,
                entry.role,
                true,
                MediaConfig::text(),
            ));
            frames.push(build_text_input(prompt_name, &content_name, &entry.text));
            frames.push(build_content_end(prompt_name, &content_name));
        }
        frames
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn pending(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user_text,
            Role::Assistant => &self.assistant_text,
            Role::System | Role::Tool => "",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct CheckpointIds {
    session: Option<String>,
    invocation: Option<String>,
}

/// Best-effort writer of history entries to a [`SessionStore`].
///
/// Store failures are logged and swallowed; in-memory history stays
/// authoritative for the life of the engine.
pub struct Checkpointer {
    store: Arc<dyn SessionStore>,
    user_id: Option<String>,
    ids: Mutex<CheckpointIds>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn SessionStore>, user_id: Option<String>) -> Self {
        Self {
            store,
            user_id,
            ids: Mutex::new(CheckpointIds::default()),
        }
    }

    /// Opens a fresh store session and invocation. Returns the store
    /// session id, or `None` if the store is unavailable.
    pub async fn begin(&self, session_id: &str) -> Option<String> {
        let mut ids = self.ids.lock().await;
        if ids.session.is_some() {
            return ids.session.clone();
        }
        match self.open_fresh().await {
            Ok((session, invocation)) => {
                ids.session = Some(session.clone());
                ids.invocation = Some(invocation);
                Some(session)
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "history checkpoint unavailable");
                None
            }
        }
    }

    async fn open_fresh(&self) -> Result<(String, String), StoreError> {
        let session = self.store.create_session(self.user_id.as_deref()).await?;
        let invocation = self.store.create_invocation(&session).await?;
        Ok((session, invocation))
    }

    /// Loads the latest invocation under `store_session_id`, oldest entry
    /// first, and continues checkpointing into it.
    pub async fn restore(&self, store_session_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let invocation = match self.store.latest_invocation(store_session_id).await? {
            Some(id) => id,
            None => self.store.create_invocation(store_session_id).await?,
        };
        let mut steps = self.store.list_steps(&invocation).await?;
        steps.reverse();

        let mut ids = self.ids.lock().await;
        ids.session = Some(store_session_id.to_string());
        ids.invocation = Some(invocation);
        Ok(steps)
    }

    /// Writes closed entries. Never fails the caller.
    pub async fn persist(&self, session_id: &str, entries: &[HistoryEntry]) {
        if entries.is_empty() {
            return;
        }
        let invocation = {
            let ids = self.ids.lock().await;
            ids.invocation.clone()
        };
        let Some(invocation) = invocation else {
            tracing::debug!(session_id, "no history checkpoint; keeping entries in memory only");
            return;
        };
        for entry in entries {
            if let Err(e) = self.store.put_step(&invocation, entry).await {
                tracing::warn!(session_id, error = %e, "failed to persist history entry");
                return;
            }
        }
        tracing::debug!(session_id, count = entries.len(), "history checkpointed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use parley_protocol::Pairing;
    use parley_types::INTERRUPTED_MARKER;

    #[test]
    fn same_role_fragments_concatenate() {
        let mut turns = TurnBuffer::new();
        for part in ["I met ", "with Dr. ", "Harper"] {
            assert!(turns.push_fragment(Role::User, part));
        }
        let closed = turns.complete_turn();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].role, Role::User);
        assert_eq!(closed[0].text, "I met with Dr. Harper");
        assert_eq!(turns.ordinal(), 1);
    }

    #[test]
    fn interrupted_fragments_are_dropped() {
        let mut turns = TurnBuffer::new();
        turns.push_fragment(Role::Assistant, "Sure, ");
        assert!(!turns.push_fragment(Role::Assistant, INTERRUPTED_MARKER));
        assert_eq!(turns.pending(Role::Assistant), "Sure, ");
        assert!(!turns.push_fragment(Role::System, "ignored"));
    }

    #[test]
    fn repeated_completion_adds_nothing_but_counts() {
        let mut turns = TurnBuffer::new();
        turns.push_fragment(Role::User, "hello");
        assert_eq!(turns.complete_turn().len(), 1);
        assert!(turns.complete_turn().is_empty());
        assert!(turns.complete_turn().is_empty());
        assert_eq!(turns.entries().len(), 1);
        assert_eq!(turns.ordinal(), 3);
    }

    #[test]
    fn replay_is_chronological_with_fresh_names() {
        let mut turns = TurnBuffer::new();
        assert!(!turns.has_context());
        for (i, text) in ["first", "second", "third"].iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            turns.push_fragment(role, text);
            turns.complete_turn();
        }
        assert!(turns.has_context());

        let frames = turns.replay_frames("p");
        assert_eq!(frames.len(), 9);
        let texts: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                OutboundFrame::TextInput { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);

        let roles: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                OutboundFrame::ContentStart(start) => Some(start.role),
                _ => None,
            })
            .collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::User]);

        let mut names: Vec<_> = frames
            .iter()
            .filter_map(|f| match f.pairing() {
                Pairing::Opens(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();
        names.dedup();
        assert_eq!(names.len(), 3);
        assert_ne!(turns.replay_frames("p")[0], frames[0], "names are never reused");
    }

    #[test]
    fn restore_marks_context_even_when_empty() {
        let mut turns = TurnBuffer::new();
        turns.restore(Vec::new());
        assert!(turns.has_context());
        assert!(turns.replay_frames("p").is_empty());
    }

    #[tokio::test]
    async fn checkpoint_round_trip_restores_chronological_order() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let writer = Checkpointer::new(Arc::clone(&store), Some("rep".to_string()));
        let store_session = writer.begin("s-1").await.expect("store session");

        let mut turns = TurnBuffer::new();
        turns.push_fragment(Role::User, "one");
        turns.push_fragment(Role::Assistant, "two");
        writer.persist("s-1", &turns.complete_turn()).await;
        turns.push_fragment(Role::User, "three");
        writer.persist("s-1", &turns.complete_turn()).await;

        let reader = Checkpointer::new(store, None);
        let restored = reader.restore(&store_session).await.expect("restore");
        let texts: Vec<_> = restored.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);

        let mut fresh = TurnBuffer::new();
        fresh.restore(restored);
        assert_eq!(fresh.ordinal(), 2);
    }

    #[tokio::test]
    async fn persistence_failure_is_swallowed() {
        let store = Arc::new(MemorySessionStore::new());
        let writer = Checkpointer::new(store.clone(), None);
        assert!(writer.begin("s-2").await.is_some());
        store.set_unavailable(true);

        let mut turns = TurnBuffer::new();
        turns.push_fragment(Role::User, "kept in memory");
        let closed = turns.complete_turn();
        writer.persist("s-2", &closed).await;
        assert_eq!(turns.entries().len(), 1);
    }
}
