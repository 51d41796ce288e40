//! Parley server library logic.

pub mod api;
pub mod api_sse;
pub mod api_ws;
pub mod compliance;
pub mod config;
pub mod records;
pub mod store;
pub mod tools;
pub mod webhook;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::Config;
use parley_engine::{
    DuplexTransport, EngineDeps, EngineSettings, RegistrySettings, SessionRegistry, SessionStore,
};
use parley_protocol::{AudioInputConfig, AudioOutputConfig, InferenceConfig};
use records::RecordStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use webhook::WebhookClient;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Every live conversation engine.
    pub registry: Arc<SessionRegistry>,
    /// CRM record store, also reported by `/health`.
    pub records: Arc<dyn RecordStore>,
}

/// Maximum request body size (4 MiB). Audio chunks are the largest bodies.
const MAX_REQUEST_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Engine defaults derived from the `model`, `inference`, `audio`,
/// `prompt` and `sessions` sections.
pub fn engine_settings(config: &Config) -> EngineSettings {
    EngineSettings {
        inference: InferenceConfig {
            max_tokens: config.inference.max_tokens,
            top_p: config.inference.top_p,
            temperature: config.inference.temperature,
        },
        audio_input: AudioInputConfig {
            sample_rate_hertz: config.audio.input_sample_rate,
            sample_size_bits: config.audio.sample_size_bits,
            channel_count: config.audio.channels,
        },
        audio_output: AudioOutputConfig {
            sample_rate_hertz: config.audio.output_sample_rate,
            sample_size_bits: config.audio.sample_size_bits,
            channel_count: config.audio.channels,
            voice_id: config.audio.voice_id.clone(),
        },
        system_prompt: config.prompt.system_prompt.clone(),
        connect_timeout: Duration::from_secs(config.model.connect_timeout_secs),
        close_timeout: Duration::from_secs(config.sessions.close_timeout_secs),
    }
}

pub fn registry_settings(config: &Config) -> RegistrySettings {
    RegistrySettings {
        max_sessions: config.sessions.max_concurrent,
        idle_timeout: config.sessions.idle_timeout(),
        reap_interval: config.sessions.reap_interval(),
    }
}

/// Wires the CRM tools, compliance filter and history store into a
/// session registry.
pub fn build_registry(
    config: &Config,
    transport: Arc<dyn DuplexTransport>,
    store: Arc<dyn SessionStore>,
    records: Arc<dyn RecordStore>,
    webhook: WebhookClient,
) -> Arc<SessionRegistry> {
    let deps = EngineDeps {
        transport,
        tools: Arc::new(tools::crm_tools(records, webhook)),
        store,
        compliance: compliance::PhraseListFilter::from_config(&config.compliance),
        settings: engine_settings(config),
    };
    SessionRegistry::new(deps, registry_settings(config))
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let records_ok = state.records.health().await;
    Json(json!({
        "status": if records_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "record_store": records_ok,
        "active_sessions": state.registry.active_count().await,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session/start", post(api::start_session_handler))
        .route(
            "/session/{id}",
            axum::routing::delete(api::end_session_handler),
        )
        .route("/session/{id}/info", get(api::session_info_handler))
        .route("/session/{id}/next-turn", post(api::next_turn_handler))
        .route("/admin/audit/session/{id}", get(api::session_audit_handler))
        .route("/audio/start", post(api::audio_start_handler))
        .route("/audio/chunk", post(api::audio_chunk_handler))
        .route("/audio/end", post(api::audio_end_handler))
        .route("/events/stream/{id}", get(api_sse::event_stream_handler))
        .route("/ws", get(api_ws::ws_new_session_handler))
        .route("/ws/{id}", get(api_ws::ws_attach_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use parley_db::{create_pool, run_migrations, DbRuntimeSettings, IN_MEMORY};
    use parley_engine::testing::ScriptedTransport;
    use parley_engine::MemorySessionStore;
    use records::SqliteRecordStore;
    use tower::ServiceExt;

    fn test_state(config: &Config) -> AppState {
        let pool = create_pool(IN_MEMORY, DbRuntimeSettings::default())
        .unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool));
        let registry = build_registry(
            config,
            Arc::new(ScriptedTransport::new()),
            Arc::new(MemorySessionStore::new()),
            Arc::clone(&records),
            WebhookClient::new(&config.webhook).unwrap(),
        );
        AppState { registry, records }
    }

    fn test_app(config: &Config) -> Router {
        app(test_state(config))
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let response = test_app(&Config::default())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["record_store"], true);
    }

    #[tokio::test]
    async fn unknown_session_is_404_with_json_error() {
        let response = test_app(&Config::default())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/session/nope/next-turn")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "session nope");
    }

    #[tokio::test]
    async fn engine_closed_by_a_concurrent_end_is_not_found() {
        let state = test_state(&Config::default());
        let engine = state
            .registry
            .create(parley_engine::StartOptions::default())
            .await
            .unwrap();
        let session_id = engine.session_id().to_string();
        assert!(state.registry.end_session(&session_id).await);

        let err = api::engine_call(&state, &session_id, engine.add_audio_chunk(&[1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, api::ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn closed_engine_still_registered_is_a_conflict() {
        let state = test_state(&Config::default());
        let engine = state
            .registry
            .create(parley_engine::StartOptions::default())
            .await
            .unwrap();
        engine.close().await;

        let err = api::engine_call(&state, engine.session_id(), engine.subscribe())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, api::ApiError::Conflict(_)));
    }

    #[test]
    fn settings_follow_config_sections() {
        let mut config = Config::default();
        config.audio.voice_id = "tiffany".to_string();
        config.sessions.max_concurrent = 3;
        config.sessions.idle_timeout_secs = 42;

        let engine = engine_settings(&config);
        assert_eq!(engine.audio_output.voice_id, "tiffany");
        assert_eq!(engine.audio_output.sample_rate_hertz, 24_000);
        assert_eq!(engine.audio_input.sample_rate_hertz, 16_000);
        assert_eq!(engine.close_timeout, Duration::from_secs(5));

        let registry = registry_settings(&config);
        assert_eq!(registry.max_sessions, 3);
        assert_eq!(registry.idle_timeout, Duration::from_secs(42));
    }
}
