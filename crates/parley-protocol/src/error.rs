use thiserror::Error;

/// Errors produced while encoding an outbound frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("failed to encode {frame} frame: {source}")]
    Encode {
        frame: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced while decoding inbound text that is valid JSON but does
/// not describe any frame.
///
/// Payloads that are not JSON at all are not errors; they surface as
/// [`crate::InboundFrame::RawData`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("payload has no `event` envelope")]
    MissingEnvelope,

    #[error("event envelope is empty")]
    EmptyEnvelope,
}
