//! Process-wide table of live engines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::{Engine, EngineDeps, SessionInfo, StartOptions};
use crate::error::RegistryError;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    /// Engines idle for at least this long are closed by the reaper.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
        }
    }
}

struct Entry {
    engine: Arc<Engine>,
    // Released when the entry is dropped, after the engine is closed.
    _permit: OwnedSemaphorePermit,
}

pub struct SessionRegistry {
    deps: EngineDeps,
    settings: RegistrySettings,
    sessions: RwLock<HashMap<String, Entry>>,
    capacity: Arc<Semaphore>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(deps: EngineDeps, settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            capacity: Arc::new(Semaphore::new(settings.max_sessions)),
            deps,
            settings,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Starts a new engine under a fresh session id.
    pub async fn create(&self, options: StartOptions) -> Result<Arc<Engine>, RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }
        let permit = Arc::clone(&self.capacity)
            .try_acquire_owned()
            .map_err(|_| RegistryError::AtCapacity {
                max: self.settings.max_sessions,
            })?;

        let session_id = Uuid::new_v4().to_string();
        let engine = Engine::start(session_id.clone(), options, &self.deps).await?;

        let active = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                session_id.clone(),
                Entry {
                    engine: Arc::clone(&engine),
                    _permit: permit,
                },
            );
            sessions.len()
        };
        tracing::info!(session_id = %session_id, active, "session created");
        Ok(engine)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Engine>, RegistryError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| Arc::clone(&entry.engine))
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }

    pub async fn touch(&self, session_id: &str) -> Result<(), RegistryError> {
        self.get(session_id).await?.touch();
        Ok(())
    }

    pub async fn info(&self, session_id: &str) -> Result<SessionInfo, RegistryError> {
        Ok(self.get(session_id).await?.info())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Removes and closes one session. Returns `false` if it was not live.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let entry = self.sessions.write().await.remove(session_id);
        let Some(entry) = entry else {
            return false;
        };
        entry.engine.close().await;
        tracing::info!(session_id, "session ended");
        true
    }

    /// Closes every session idle for at least the configured timeout.
    pub async fn reap_idle(&self) -> Vec<String> {
        let idle: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.engine.idle_for() >= self.settings.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for session_id in idle {
            if self.end_session(&session_id).await {
                tracing::info!(session_id = %session_id, "idle session reaped");
                reaped.push(session_id);
            }
        }
        reaped
    }

    /// Runs [`reap_idle`](Self::reap_idle) on an interval until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.settings.reap_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let reaped = registry.reap_idle().await;
                        if !reaped.is_empty() {
                            tracing::debug!(count = reaped.len(), "reaper pass finished");
                        }
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }

    /// Stops the reaper, refuses new sessions, and closes every live one.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        let entries: Vec<Entry> = self.sessions.write().await.drain().map(|(_, e)| e).collect();
        let count = entries.len();
        futures_util::future::join_all(entries.iter().map(|entry| entry.engine.close())).await;
        tracing::info!(count, "all sessions closed");
    }
}
