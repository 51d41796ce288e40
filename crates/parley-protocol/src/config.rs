use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sampling parameters sent in `sessionStart`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

/// PCM format of the caller's microphone audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInputConfig {
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
}

impl Default for AudioInputConfig {
    fn default() -> Self {
        Self {
            sample_rate_hertz: 16_000,
            sample_size_bits: 16,
            channel_count: 1,
        }
    }
}

/// PCM format and voice the model should speak with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOutputConfig {
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub voice_id: String,
}

impl Default for AudioOutputConfig {
    fn default() -> Self {
        Self {
            sample_rate_hertz: 24_000,
            sample_size_bits: 16,
            channel_count: 1,
            voice_id: "matthew".to_string(),
        }
    }
}

/// One entry of the tool catalog advertised in `promptStart`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the tool input.
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}
