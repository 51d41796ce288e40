use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::TransportError;
use crate::queue::OutboundFrames;

/// Text messages received from the remote model, in arrival order. The
/// stream ends when the remote side closes.
pub type InboundStream = BoxStream<'static, Result<String, TransportError>>;

/// A connection able to carry outbound and inbound frames at the same time.
///
/// `open` takes ownership of the outbound side and must keep pulling frames
/// from it until it returns `None`, writing each one to the remote end in
/// order. The returned stream is the inbound half.
#[async_trait]
pub trait DuplexTransport: Send + Sync + 'static {
    async fn open(
        &self,
        session_id: &str,
        outbound: OutboundFrames,
    ) -> Result<InboundStream, TransportError>;
}
