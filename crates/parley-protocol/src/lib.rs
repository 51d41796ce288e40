//! Frame vocabulary for the bidirectional speech-model stream.
//!
//! Everything in this crate is pure: builders return [`OutboundFrame`]
//! values, [`encode_frame`] turns them into the JSON text written to the
//! duplex channel, and [`parse_inbound_frame`] turns received text back into
//! an [`InboundFrame`]. No I/O happens here.
//!
//! # Outbound frames
//!
//! | Frame | Scope | Notes |
//! |-------|-------|-------|
//! | `sessionStart` | session | inference configuration |
//! | `promptStart` | prompt | output media configuration, tool catalog |
//! | `contentStart` | content block | `AUDIO`, `TEXT` or `TOOL` |
//! | `textInput` / `audioInput` / `toolResult` | content block | payload |
//! | `contentEnd` | content block | exactly one per `contentStart` |
//! | `promptEnd` | prompt | |
//! | `sessionEnd` | session | |
//!
//! Every frame is wrapped as `{"event": {"<name>": {...}}}` on the wire.
//!
//! # Usage
//!
//! ```rust,ignore
//! use parley_protocol::{build_text_input, encode_frame};
//!
//! let frame = build_text_input(&prompt_name, &content_name, "hello");
//! let text = encode_frame(&frame)?;
//! ```

mod codec;
mod config;
mod decode;
mod error;
mod frame;

pub use codec::{
    build_audio_input, build_content_end, build_content_start, build_prompt_end,
    build_prompt_start, build_session_end, build_session_start, build_text_input,
    build_tool_result, encode_frame, new_content_name,
};
pub use config::{AudioInputConfig, AudioOutputConfig, InferenceConfig, ToolSpec};
pub use decode::{
    classify_error, parse_inbound_frame, ErrorClass, GenerationStage, InboundFrame, RemoteError,
    EXPECTED_ERROR_MARKERS,
};
pub use error::{DecodeError, ProtocolError};
pub use frame::{ContentKind, ContentStart, MediaConfig, OutboundFrame, Pairing};
