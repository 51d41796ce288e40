use parley_types::Role;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Case-insensitive substrings that mark a remote error as recoverable:
/// a turn already in progress, or the idle timeout waiting for input.
pub const EXPECTED_ERROR_MARKERS: [&str; 2] = ["already in progress", "timed out waiting for input"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Informational; the stream stays open.
    Expected,
    /// Terminal for the duplex channel.
    Unexpected,
}

pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if EXPECTED_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
        ErrorClass::Expected
    } else {
        ErrorClass::Unexpected
    }
}

/// An error reported by the remote model inside the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub class: ErrorClass,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify_error(&message);
        Self { message, class }
    }

    pub fn is_expected(&self) -> bool {
        self.class == ErrorClass::Expected
    }
}

/// `additionalModelFields.generationStage` of an inbound content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStage {
    Speculative,
    Final,
}

/// One decoded frame received from the remote model.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ContentStart {
        role: Option<Role>,
        content_id: Option<String>,
        kind: Option<String>,
        generation_stage: Option<GenerationStage>,
    },
    TextOutput {
        role: Option<Role>,
        content: String,
    },
    /// Base64 PCM, forwarded untouched.
    AudioOutput {
        content: String,
    },
    ToolUse {
        tool_name: String,
        tool_use_id: String,
        /// Input as sent by the model: an object or a JSON-encoded string.
        input: Value,
    },
    ContentEnd {
        stop_reason: Option<String>,
    },
    Error(RemoteError),
    /// A well-formed frame this crate does not interpret
    /// (`completionStart`, `usageEvent`, ...).
    Other {
        name: String,
    },
    /// The payload could not be decoded.
    RawData(String),
}

impl InboundFrame {
    pub fn name(&self) -> &str {
        match self {
            Self::ContentStart { .. } => "contentStart",
            Self::TextOutput { .. } => "textOutput",
            Self::AudioOutput { .. } => "audioOutput",
            Self::ToolUse { .. } => "toolUse",
            Self::ContentEnd { .. } => "contentEnd",
            Self::Error(_) => "error",
            Self::Other { name } => name,
            Self::RawData(_) => "raw_data",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContentStart {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content_id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    additional_model_fields: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTextOutput {
    #[serde(default)]
    role: Option<String>,
    content: String,
}

#[derive(Deserialize)]
struct RawAudioOutput {
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolUse {
    tool_name: String,
    tool_use_id: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContentEnd {
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Decodes one text message received from the remote stream.
///
/// Non-JSON text and frames whose body does not match the expected shape
/// come back as [`InboundFrame::RawData`]. A payload carrying an `error`
/// field (top level or inside the envelope) becomes [`InboundFrame::Error`]
/// classified by [`classify_error`].
pub fn parse_inbound_frame(raw: &str) -> Result<InboundFrame, DecodeError> {
    if raw.trim().is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Ok(InboundFrame::RawData(raw.to_string())),
    };
    let Value::Object(root) = value else {
        return Ok(InboundFrame::RawData(raw.to_string()));
    };

    if let Some(err) = root.get("error") {
        return Ok(InboundFrame::Error(RemoteError::new(error_message(err))));
    }

    let envelope = match root.get("event") {
        Some(Value::Object(map)) => map,
        Some(_) => return Ok(InboundFrame::RawData(raw.to_string())),
        None => return Err(DecodeError::MissingEnvelope),
    };

    let Some((name, body)) = envelope.iter().next() else {
        return Err(DecodeError::EmptyEnvelope);
    };

    Ok(decode_event(name, body).unwrap_or_else(|| InboundFrame::RawData(raw.to_string())))
}

fn decode_event(name: &str, body: &Value) -> Option<InboundFrame> {
    let frame = match name {
        "contentStart" => {
            let raw: RawContentStart = serde_json::from_value(body.clone()).ok()?;
            InboundFrame::ContentStart {
                role: raw.role.as_deref().and_then(|r| r.parse().ok()),
                content_id: raw.content_id,
                kind: raw.kind,
                generation_stage: raw.additional_model_fields.as_ref().and_then(generation_stage),
            }
        }
        "textOutput" => {
            let raw: RawTextOutput = serde_json::from_value(body.clone()).ok()?;
            InboundFrame::TextOutput {
                role: raw.role.as_deref().and_then(|r| r.parse().ok()),
                content: raw.content,
            }
        }
        "audioOutput" => {
            let raw: RawAudioOutput = serde_json::from_value(body.clone()).ok()?;
            InboundFrame::AudioOutput {
                content: raw.content,
            }
        }
        "toolUse" => {
            let raw: RawToolUse = serde_json::from_value(body.clone()).ok()?;
            InboundFrame::ToolUse {
                tool_name: raw.tool_name,
                tool_use_id: raw.tool_use_id,
                input: raw.content.or(raw.input).unwrap_or(Value::Object(Map::new())),
            }
        }
        "contentEnd" => {
            let raw: RawContentEnd = serde_json::from_value(body.clone()).ok()?;
            InboundFrame::ContentEnd {
                stop_reason: raw.stop_reason,
            }
        }
        "error" => InboundFrame::Error(RemoteError::new(error_message(body))),
        other => InboundFrame::Other {
            name: other.to_string(),
        },
    };
    Some(frame)
}

/// `additionalModelFields` arrives as a JSON-encoded string; accept an
/// object too.
fn generation_stage(fields: &Value) -> Option<GenerationStage> {
    let parsed;
    let obj = match fields {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).ok()?;
            &parsed
        }
        other => other,
    };
    match obj.get("generationStage")?.as_str()? {
        "SPECULATIVE" => Some(GenerationStage::Speculative),
        "FINAL" => Some(GenerationStage::Final),
        _ => None,
    }
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        other => other.to_string(),
    }
}
