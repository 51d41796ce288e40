//! SQLite-backed history checkpoint store.

use async_trait::async_trait;
use parley_db::{history, DbPool, HistoryStoreError};
use parley_engine::{SessionStore, StoreError};
use parley_types::HistoryEntry;

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, HistoryStoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            f(&*conn).map_err(store_error)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

fn store_error(err: HistoryStoreError) -> StoreError {
    match err {
        HistoryStoreError::UnknownSession(id) | HistoryStoreError::UnknownInvocation(id) => {
            StoreError::NotFound(id)
        }
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, user_id: Option<&str>) -> Result<String, StoreError> {
        let user_id = user_id.map(str::to_string);
        self.run(move |conn| history::create_session(conn, user_id.as_deref()))
            .await
    }

    async fn create_invocation(&self, session_id: &str) -> Result<String, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| history::create_invocation(conn, &session_id))
            .await
    }

    async fn put_step(&self, invocation_id: &str, entry: &HistoryEntry) -> Result<(), StoreError> {
        let invocation_id = invocation_id.to_string();
        let entry = entry.clone();
        self.run(move |conn| history::append_step(conn, &invocation_id, &entry).map(|_| ()))
            .await
    }

    async fn latest_invocation(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let session_id = session_id.to_string();
        self.run(move |conn| history::latest_invocation(conn, &session_id))
            .await
    }

    async fn list_steps(&self, invocation_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let invocation_id = invocation_id.to_string();
        self.run(move |conn| history::list_steps(conn, &invocation_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_db::{create_pool, run_migrations, DbRuntimeSettings, IN_MEMORY};
    use parley_types::Role;

    fn store() -> SqliteSessionStore {
        let pool = create_pool(IN_MEMORY, DbRuntimeSettings::default())
        .expect("pool");
        run_migrations(&pool.get().expect("conn")).expect("migrations");
        SqliteSessionStore::new(pool)
    }

    #[tokio::test]
    async fn steps_come_back_newest_first() {
        let store = store();
        let session = store.create_session(Some("rep-1")).await.expect("session");
        let invocation = store.create_invocation(&session).await.expect("invocation");
        for (ordinal, text) in ["first", "second"].iter().enumerate() {
            let entry = HistoryEntry {
                ordinal: ordinal as u64,
                role: Role::User,
                text: text.to_string(),
                completed_at: Utc::now(),
            };
            store.put_step(&invocation, &entry).await.expect("step");
        }

        let steps = store.list_steps(&invocation).await.expect("steps");
        let texts: Vec<_> = steps.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, ["second", "first"]);
        assert_eq!(
            store.latest_invocation(&session).await.expect("latest"),
            Some(invocation)
        );
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = store();
        assert!(matches!(
            store.create_invocation("missing").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.latest_invocation("missing").await.expect("query"), None);
    }
}
