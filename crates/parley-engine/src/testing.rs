//! In-process transport for driving engines from tests.
//!
//! Each `open` produces a [`RemoteEnd`] that plays the model: it sees every
//! outbound frame as JSON and can push inbound messages or fail the channel.

use std::sync::Mutex;

use async_trait::async_trait;
use parley_protocol::encode_frame;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::queue::OutboundFrames;
use crate::transport::{DuplexTransport, InboundStream};

type Inbound = Result<String, TransportError>;

pub struct ScriptedTransport {
    remotes_tx: mpsc::UnboundedSender<RemoteEnd>,
    remotes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteEnd>>,
    refuse: Mutex<Option<String>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            remotes_tx,
            remotes_rx: tokio::sync::Mutex::new(remotes_rx),
            refuse: Mutex::new(None),
        }
    }

    /// The next `open` fails with `TransportError::Connect(reason)`.
    pub fn refuse_next(&self, reason: impl Into<String>) {
        *self.refuse.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason.into());
    }

    /// Remote end of the next opened connection, in open order.
    pub async fn next_remote(&self) -> Option<RemoteEnd> {
        self.remotes_rx.lock().await.recv().await
    }
}

#[async_trait]
impl DuplexTransport for ScriptedTransport {
    async fn open(
        &self,
        session_id: &str,
        mut outbound: OutboundFrames,
    ) -> Result<InboundStream, TransportError> {
        if let Some(reason) = self.refuse.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(TransportError::Connect(reason));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let finished = CancellationToken::new();

        let writer_done = finished.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound.next().await {
                let Ok(text) = encode_frame(&frame) else { continue };
                let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                if frames_tx.send(value).is_err() {
                    break;
                }
            }
            // The remote hangs up once the client stops writing.
            writer_done.cancel();
        });

        let remote = RemoteEnd {
            session_id: session_id.to_string(),
            frames: frames_rx,
            inbound: inbound_tx,
            finished: finished.clone(),
        };
        let _ = self.remotes_tx.send(remote);

        let stream = futures_util::stream::unfold(
            (inbound_rx, finished),
            |(mut rx, finished)| async move {
                tokio::select! {
                    biased;
                    item = rx.recv() => item.map(|item| (item, (rx, finished))),
                    _ = finished.cancelled() => match rx.try_recv() {
                        Ok(item) => Some((item, (rx, finished))),
                        Err(_) => None,
                    },
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

/// The model side of one scripted connection.
pub struct RemoteEnd {
    session_id: String,
    frames: mpsc::UnboundedReceiver<Value>,
    inbound: mpsc::UnboundedSender<Inbound>,
    finished: CancellationToken,
}

impl RemoteEnd {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next outbound frame as `(name, body)`. `None` once the client has
    /// stopped writing and every frame was read.
    pub async fn recv_frame(&mut self) -> Option<(String, Value)> {
        self.frames.recv().await.and_then(split_envelope)
    }

    /// Reads frames until `name` shows up, returning it and everything
    /// skipped before it.
    pub async fn recv_until(&mut self, name: &str) -> Option<(Value, Vec<(String, Value)>)> {
        let mut skipped = Vec::new();
        while let Some((frame_name, body)) = self.recv_frame().await {
            if frame_name == name {
                return Some((body, skipped));
            }
            skipped.push((frame_name, body));
        }
        None
    }

    /// Sends `{"event": {name: body}}` to the client.
    pub fn send_event(&self, name: &str, body: Value) {
        let mut event = serde_json::Map::new();
        event.insert(name.to_string(), body);
        self.send(Value::Object(serde_json::Map::from_iter([(
            "event".to_string(),
            Value::Object(event),
        )])));
    }

    pub fn send(&self, message: Value) {
        self.send_raw(message.to_string());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(text.into()));
    }

    /// Fails the inbound half with a receive error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Err(TransportError::Receive(reason.into())));
    }

    /// Ends the inbound half cleanly.
    pub fn hang_up(&self) {
        self.finished.cancel();
    }
}

fn split_envelope(value: Value) -> Option<(String, Value)> {
    let Value::Object(mut root) = value else { return None };
    let Value::Object(event) = root.remove("event")? else { return None };
    event.into_iter().next()
}
