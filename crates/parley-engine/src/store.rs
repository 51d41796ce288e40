//! Seam to the external session store used for history checkpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_types::HistoryEntry;
use uuid::Uuid;

use crate::error::StoreError;

/// Durable storage for conversation history.
///
/// A store session groups invocations; an invocation groups ordered steps.
/// [`list_steps`](SessionStore::list_steps) returns steps newest first, so
/// readers reverse the result to recover chronological order.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn create_session(&self, user_id: Option<&str>) -> Result<String, StoreError>;

    async fn create_invocation(&self, session_id: &str) -> Result<String, StoreError>;

    async fn put_step(&self, invocation_id: &str, entry: &HistoryEntry) -> Result<(), StoreError>;

    async fn latest_invocation(&self, session_id: &str) -> Result<Option<String>, StoreError>;

    async fn list_steps(&self, invocation_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    invocations: HashMap<String, Vec<String>>,
    steps: HashMap<String, Vec<HistoryEntry>>,
}

/// Process-local [`SessionStore`]. History recovered from it only survives
/// as long as the process.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, _user_id: Option<&str>) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.state()?.invocations.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn create_invocation(&self, session_id: &str) -> Result<String, StoreError> {
        let mut state = self.state()?;
        let invocations = state
            .invocations
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let id = Uuid::new_v4().to_string();
        invocations.push(id.clone());
        state.steps.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn put_step(&self, invocation_id: &str, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.state()?
            .steps
            .get_mut(invocation_id)
            .ok_or_else(|| StoreError::NotFound(invocation_id.to_string()))?
            .push(entry.clone());
        Ok(())
    }

    async fn latest_invocation(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let state = self.state()?;
        let invocations = state
            .invocations
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        Ok(invocations.last().cloned())
    }

    async fn list_steps(&self, invocation_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state()?;
        let steps = state
            .steps
            .get(invocation_id)
            .ok_or_else(|| StoreError::NotFound(invocation_id.to_string()))?;
        Ok(steps.iter().rev().cloned().collect())
    }
}
