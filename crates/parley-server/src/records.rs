//! CRM record store used by the tool handlers.

use async_trait::async_trait;
use parley_db::{records, CallRecord, DbPool, HcpRecord, RecordError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where call records and HCP reference data live.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Persists a call and returns its primary key.
    async fn insert_call(&self, record: CallRecord) -> Result<String, RecordStoreError>;

    async fn lookup_hcp(&self, name: &str) -> Result<Option<HcpRecord>, RecordStoreError>;

    async fn health(&self) -> bool;
}

/// [`RecordStore`] backed by the SQLite pool. Queries run on the blocking
/// thread pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: DbPool,
}

impl SqliteRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RecordStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, RecordError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok(f(&*conn)?)
        })
        .await?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_call(&self, record: CallRecord) -> Result<String, RecordStoreError> {
        self.with_conn(move |conn| records::insert_call(conn, &record))
            .await
    }

    async fn lookup_hcp(&self, name: &str) -> Result<Option<HcpRecord>, RecordStoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| records::lookup_hcp_by_name(conn, &name))
            .await
    }

    async fn health(&self) -> bool {
        match self.with_conn(records::check_health).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "record store health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_db::{create_pool, run_migrations, DbRuntimeSettings, IN_MEMORY};

    fn store() -> SqliteRecordStore {
        let pool = create_pool(IN_MEMORY, DbRuntimeSettings::default())
        .expect("pool");
        {
            let conn = pool.get().expect("conn");
            run_migrations(&conn).expect("migrations");
            records::upsert_hco(&conn, "HCO_1", "Mercy General").expect("hco");
            records::upsert_hcp(&conn, "HCP_1", "Karina Soto", Some("HCO_1")).expect("hcp");
        }
        SqliteRecordStore::new(pool)
    }

    #[tokio::test]
    async fn lookup_and_insert_through_the_pool() {
        let store = store();
        assert!(store.health().await);

        let hcp = store.lookup_hcp("karina").await.expect("lookup").expect("found");
        assert_eq!(hcp.hcp_id, "HCP_1");
        assert_eq!(hcp.hco_name.as_deref(), Some("Mercy General"));
        assert!(store.lookup_hcp("Nobody Here").await.expect("lookup").is_none());

        let call_pk = store
            .insert_call(CallRecord {
                account: "Karina Soto".to_string(),
                ..CallRecord::default()
            })
            .await
            .expect("insert");
        assert!(call_pk.starts_with("CALL_"));
    }
}
