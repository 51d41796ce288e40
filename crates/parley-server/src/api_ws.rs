//! WebSocket fan-out and audio input.
//!
//! `GET /ws` starts a new session and announces it; `GET /ws/{id}` attaches
//! to an existing one. Either way the socket claims the session's single
//! event subscription. Closing the socket releases the subscription but
//! leaves the session running; `end_session` ends it.

use crate::api::ApiError;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Path, WebSocketUpgrade,
    },
    response::Response,
};
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use parley_engine::{external_events, Engine, EventSubscription, StartOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long the forwarder may keep flushing after the client ends the session.
const END_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64 PCM.
    AudioData { data: String },
    EndAudio,
    NextTurn,
    EndSession,
}

/// Control messages sent alongside the client event stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SessionCreated { session_id: String },
    Error { message: String },
}

/// Handler for `GET /ws`.
pub async fn ws_new_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let engine = state.registry.create(StartOptions::default()).await?;
    let subscription = engine.subscribe()?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, engine, subscription, true)))
}

/// Handler for `GET /ws/{id}`.
pub async fn ws_attach_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let engine = state.registry.get(&session_id).await?;
    let subscription = crate::api::engine_call(&state, &session_id, engine.subscribe()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, engine, subscription, false)))
}

fn send_control(tx: &mpsc::Sender<String>, message: &ControlMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            if tx.try_send(json).is_err() {
                tracing::warn!("websocket control message dropped; client too slow");
            }
        }
        Err(e) => tracing::error!("failed to serialize control message: {}", e),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    engine: Arc<Engine>,
    subscription: EventSubscription,
    announce: bool,
) {
    let session_id = engine.session_id().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    if announce {
        send_control(
            &tx,
            &ControlMessage::SessionCreated {
                session_id: session_id.clone(),
            },
        );
    }

    // Control messages and client events share the socket; the forwarder
    // owns the sink. It stops once the event stream ends.
    let events = external_events(subscription, engine.audio_format());
    let forward_id = session_id.clone();
    let mut forward = tokio::spawn(async move {
        tokio::pin!(events);
        loop {
            let outgoing = tokio::select! {
                biased;
                Some(control) = rx.recv() => control,
                event = events.next() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(session_id = %forward_id, "failed to serialize client event: {}", e);
                            continue;
                        }
                    },
                    None => break,
                },
            };
            if sender.send(AxumMessage::Text(outgoing.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(AxumMessage::Close(None)).await;
    });

    let mut ended = false;
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            AxumMessage::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => match handle_client_message(&state, &engine, message).await {
                    Ok(true) => {
                        ended = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => send_control(&tx, &ControlMessage::Error { message: e.to_string() }),
                },
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "failed to parse incoming WebSocket message");
                    send_control(
                        &tx,
                        &ControlMessage::Error {
                            message: "invalid message format".to_string(),
                        },
                    );
                }
            },
            AxumMessage::Close(_) => break,
            _ => {}
        }
    }

    if ended && tokio::time::timeout(END_FLUSH_TIMEOUT, &mut forward).await.is_ok() {
        return;
    }
    // Dropping the forwarder releases the subscription so another client
    // can attach.
    forward.abort();
    tracing::info!(session_id = %session_id, "websocket client detached");
}

/// Applies one client message. Returns `true` once the session has ended.
async fn handle_client_message(
    state: &AppState,
    engine: &Engine,
    message: ClientMessage,
) -> Result<bool, ApiError> {
    match message {
        ClientMessage::AudioData { data } => {
            let pcm = base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map_err(|e| ApiError::BadRequest(format!("data is not valid base64: {e}")))?;
            engine.add_audio_chunk(&pcm)?;
        }
        ClientMessage::EndAudio => engine.end_audio_content()?,
        ClientMessage::NextTurn => engine.prepare_for_next_turn().await?,
        ClientMessage::EndSession => {
            state.registry.end_session(engine.session_id()).await;
            return Ok(true);
        }
    }
    Ok(false)
}
