#![allow(dead_code)]

use parley_db::{create_pool, records, run_migrations, DbRuntimeSettings, IN_MEMORY};
use parley_engine::testing::{RemoteEnd, ScriptedTransport};
use parley_engine::SessionRegistry;
use parley_server::config::Config;
use parley_server::records::{RecordStore, SqliteRecordStore};
use parley_server::store::SqliteSessionStore;
use parley_server::webhook::WebhookClient;
use parley_server::{app, build_registry, AppState};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub url: String,
    pub transport: Arc<ScriptedTransport>,
    pub registry: Arc<SessionRegistry>,
}

/// Starts the full router on an ephemeral port with an in-memory database
/// (one HCP seeded) and a scripted model transport.
pub async fn spawn_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let mut config = Config::default();
    config.sessions.close_timeout_secs = 2;
    configure(&mut config);

    // A single connection keeps every query on the same in-memory database.
    let pool = create_pool(IN_MEMORY, DbRuntimeSettings::default())
    .unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        records::upsert_hco(&conn, "HCO_9", "Lakeside Cardiology").unwrap();
        records::upsert_hcp(&conn, "HCP_42", "Karina Soto", Some("HCO_9")).unwrap();
    }

    let transport = Arc::new(ScriptedTransport::new());
    let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool.clone()));
    let store = Arc::new(SqliteSessionStore::new(pool));
    let webhook = WebhookClient::new(&config.webhook).unwrap();
    let registry = build_registry(&config, transport.clone(), store, records.clone(), webhook);

    let app = app(AppState {
        registry: registry.clone(),
        records,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        url: format!("http://{}", addr),
        transport,
        registry,
    }
}

impl TestServer {
    /// Waits for the next engine to connect and consumes its handshake.
    pub async fn remote(&self) -> RemoteEnd {
        let mut remote = tokio::time::timeout(Duration::from_secs(5), self.transport.next_remote())
            .await
            .expect("engine connected in time")
            .expect("transport open");
        for expected in ["sessionStart", "promptStart", "contentStart", "textInput", "contentEnd"] {
            let (name, _) = recv(&mut remote).await;
            assert_eq!(name, expected);
        }
        remote
    }

    pub async fn start_session(&self, client: &reqwest::Client, body: Value) -> String {
        let response = client
            .post(format!("{}/session/start", self.url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let json: Value = response.json().await.unwrap();
        assert_eq!(json["status"], "started");
        json["session_id"].as_str().unwrap().to_string()
    }
}

pub async fn recv(remote: &mut RemoteEnd) -> (String, Value) {
    tokio::time::timeout(Duration::from_secs(5), remote.recv_frame())
        .await
        .expect("frame in time")
        .expect("writer still open")
}

pub async fn recv_until(remote: &mut RemoteEnd, name: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), remote.recv_until(name))
        .await
        .expect("frame in time")
        .expect("writer still open")
        .0
}
