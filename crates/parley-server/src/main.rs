//! Parley server binary.
//!
//! Starts an axum HTTP server in front of the conversation engines, with
//! structured logging, database initialization, an idle-session reaper and
//! graceful shutdown on SIGTERM/SIGINT.

use parley_engine::{MemorySessionStore, SessionStore, WsTransport, WsTransportConfig};
use parley_server::records::{RecordStore, SqliteRecordStore};
use parley_server::store::SqliteSessionStore;
use parley_server::webhook::WebhookClient;
use parley_server::{app, build_registry, config, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = parley_db::create_pool(
        &config.database.path,
        parley_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = parley_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let store: Arc<dyn SessionStore> = if config.history.enabled {
        Arc::new(SqliteSessionStore::new(pool.clone()))
    } else {
        tracing::info!("history checkpoints kept in memory only");
        Arc::new(MemorySessionStore::new())
    };
    let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));
    let webhook = WebhookClient::new(&config.webhook).expect("failed to build webhook HTTP client");
    if !webhook.is_configured() {
        tracing::warn!("webhook.url not set; webhook tools will skip delivery");
    }
    let transport = Arc::new(WsTransport::new(WsTransportConfig {
        endpoint_url: config.model.endpoint_url.clone(),
        auth_token: config.model.auth_token.clone(),
        model_id: config.model.model_id.clone(),
    }));

    let registry = build_registry(&config, transport, store, Arc::clone(&records), webhook);
    let reaper = registry.spawn_reaper();

    let app = app(AppState {
        registry: Arc::clone(&registry),
        records,
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, model = %config.model.model_id, "starting parley server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    registry.shutdown().await;
    let _ = reaper.await;

    tracing::info!("parley server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
