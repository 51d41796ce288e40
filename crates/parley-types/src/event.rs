//! Client-facing events emitted by the fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output audio format attached to every `audio_response` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
        }
    }
}

/// Whether a `tool_log` event reports the start or the outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolLogSubtype {
    Invocation,
    Result,
}

/// Events delivered to an external subscriber over SSE or WebSocket.
///
/// Serialized with a `type` tag matching [`ExternalEvent::name`], e.g.
/// `{"type":"transcript","speaker":"user","text":"hi","timestamp":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ExternalEvent {
    Transcript {
        speaker: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    AudioResponse {
        /// Base64 PCM exactly as received from the model.
        audio_data: String,
        /// Always `"pcm"`.
        format: String,
        sample_rate: u32,
        channels: u16,
        timestamp: DateTime<Utc>,
    },
    ContentStart {
        role: String,
        timestamp: DateTime<Utc>,
    },
    ContentEnd {
        timestamp: DateTime<Utc>,
    },
    ToolLog {
        subtype: ToolLogSubtype,
        tool_name: String,
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    Status {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExternalEvent {
    /// Event name used for the SSE `event:` field and the JSON `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transcript { .. } => "transcript",
            Self::AudioResponse { .. } => "audio_response",
            Self::ContentStart { .. } => "content_start",
            Self::ContentEnd { .. } => "content_end",
            Self::ToolLog { .. } => "tool_log",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }

    pub fn transcript(speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Transcript {
            speaker: speaker.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn audio(audio_data: impl Into<String>, format: AudioFormat) -> Self {
        Self::AudioResponse {
            audio_data: audio_data.into(),
            format: "pcm".to_string(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            timestamp: Utc::now(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_response_uses_camel_case_fields() {
        let event = ExternalEvent::audio("AAAA", AudioFormat::default());
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "audio_response");
        assert_eq!(json["audioData"], "AAAA");
        assert_eq!(json["sampleRate"], 24_000);
        assert_eq!(json["channels"], 1);
        assert!(json.get("audio_data").is_none());
    }

    #[test]
    fn tool_log_omits_absent_payload() {
        let event = ExternalEvent::ToolLog {
            subtype: ToolLogSubtype::Result,
            tool_name: "lookupHcpTool".to_string(),
            tool_use_id: "t-1".to_string(),
            input: None,
            result: Some(serde_json::json!({"found": false})),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "tool_log");
        assert_eq!(json["subtype"], "result");
        assert_eq!(json["toolName"], "lookupHcpTool");
        assert_eq!(json["toolUseId"], "t-1");
        assert_eq!(json["result"]["found"], false);
        assert!(json.get("input").is_none());
    }

    #[test]
    fn name_matches_type_tag() {
        let events = [
            ExternalEvent::transcript("user", "hello"),
            ExternalEvent::status("ok"),
            ExternalEvent::error("boom"),
            ExternalEvent::ContentEnd {
                timestamp: Utc::now(),
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).expect("serialize");
            assert_eq!(json["type"], event.name());
        }
    }
}
