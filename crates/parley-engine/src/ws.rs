//! WebSocket transport to a bidirectional speech-model gateway.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parley_protocol::encode_frame;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::queue::OutboundFrames;
use crate::transport::{DuplexTransport, InboundStream};

#[derive(Clone)]
pub struct WsTransportConfig {
    /// `ws://` or `wss://` URL of the gateway.
    pub endpoint_url: String,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub auth_token: Option<String>,
    /// Sent as `X-Model-Id`.
    pub model_id: String,
}

impl std::fmt::Debug for WsTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransportConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// Full-duplex WebSocket transport. A writer task drains the outbound
/// frames onto the socket while the caller reads the inbound half.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }
}

fn header(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| TransportError::Connect(e.to_string()))
}

#[async_trait]
impl DuplexTransport for WsTransport {
    async fn open(
        &self,
        session_id: &str,
        outbound: OutboundFrames,
    ) -> Result<InboundStream, TransportError> {
        let mut request = self
            .config
            .endpoint_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let headers = request.headers_mut();
        if let Some(token) = &self.config.auth_token {
            headers.insert("Authorization", header(&format!("Bearer {token}"))?);
        }
        headers.insert("X-Model-Id", header(&self.config.model_id)?);
        headers.insert("X-Session-Id", header(session_id)?);

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::info!(session_id, endpoint = %self.config.endpoint_url, "model stream connected");

        let (sink, stream) = socket.split();
        let sink = sink.with(|text: String| {
            futures_util::future::ok::<_, tungstenite::Error>(Message::Text(text.into()))
        });
        let inbound = stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!("ignoring non-utf8 binary message");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            }
        });

        Ok(pump(session_id, outbound, sink, inbound))
    }
}

/// Drives one duplex connection. A writer task drains `outbound` into
/// `sink`; the returned stream is `inbound`.
///
/// When a write fails the queue is closed, so producers see
/// `QueueError::Closed` instead of filling a queue nobody drains, and the
/// inbound stream yields one `TransportError::Send` and ends.
pub(crate) fn pump<S, E, R>(
    session_id: &str,
    mut outbound: OutboundFrames,
    sink: S,
    inbound: R,
) -> InboundStream
where
    S: Sink<String, Error = E> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    R: Stream<Item = Result<String, TransportError>> + Send + 'static,
{
    let write_failed = CancellationToken::new();
    let failure: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

    let writer_session = session_id.to_string();
    let writer_failed = write_failed.clone();
    let writer_failure = Arc::clone(&failure);
    tokio::spawn(async move {
        let mut sink = Box::pin(sink);
        while let Some(frame) = outbound.next().await {
            let text = match encode_frame(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(session_id = %writer_session, error = %e, "dropping unencodable frame");
                    continue;
                }
            };
            tracing::trace!(session_id = %writer_session, frame = frame.name(), "frame sent");
            if let Err(e) = sink.send(text).await {
                tracing::warn!(session_id = %writer_session, error = %e, "model stream write failed");
                outbound.queue().close();
                let _ = writer_failure.set(e.to_string());
                writer_failed.cancel();
                return;
            }
        }
        let _ = sink.close().await;
        tracing::debug!(session_id = %writer_session, "outbound half closed");
    });

    let stream = futures_util::stream::unfold(
        (Box::pin(inbound), write_failed, failure, false),
        |(mut inbound, write_failed, failure, failed)| async move {
            if failed {
                return None;
            }
            tokio::select! {
                biased;
                _ = write_failed.cancelled() => {
                    let reason = failure.get().cloned().unwrap_or_default();
                    Some((Err(TransportError::Send(reason)), (inbound, write_failed, failure, true)))
                }
                item = inbound.next() => item.map(|item| (item, (inbound, write_failed, failure, false))),
            }
        },
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token() {
        let config = WsTransportConfig {
            endpoint_url: "wss://gateway.example/stream".to_string(),
            auth_token: Some("s3cret".to_string()),
            model_id: "amazon.nova-sonic-v1:0".to_string(),
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn invalid_url_is_a_connect_error() {
        let transport = WsTransport::new(WsTransportConfig {
            endpoint_url: "not a url".to_string(),
            auth_token: None,
            model_id: "m".to_string(),
        });
        let queue = crate::queue::OutboundQueue::new();
        let err = transport
            .open("s-1", queue.frames())
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn write_failure_closes_queue_and_fails_inbound() {
        let queue = crate::queue::OutboundQueue::new();
        let broken = futures_util::sink::unfold((), |(), _text: String| async {
            Err::<(), _>("connection reset".to_string())
        });
        let mut inbound = pump(
            "s-1",
            queue.frames(),
            broken,
            futures_util::stream::pending::<Result<String, TransportError>>(),
        );
        queue
            .enqueue(parley_protocol::build_session_end())
            .expect("queued");

        let item = tokio::time::timeout(std::time::Duration::from_secs(5), inbound.next())
            .await
            .expect("failure reported in time");
        match item {
            Some(Err(TransportError::Send(reason))) => assert_eq!(reason, "connection reset"),
            other => panic!("expected send error, got {other:?}"),
        }
        assert!(inbound.next().await.is_none());
        assert!(queue.is_closed());
        assert_eq!(
            queue.enqueue(parley_protocol::build_session_end()),
            Err(crate::error::QueueError::Closed)
        );
    }
}
