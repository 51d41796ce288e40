use parley_types::Role;
use serde::Serialize;

/// Kind of payload a content block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentKind {
    Audio,
    Text,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMediaConfiguration {
    pub media_type: String,
}

impl TextMediaConfiguration {
    pub(crate) fn plain() -> Self {
        Self {
            media_type: "text/plain".to_string(),
        }
    }

    pub(crate) fn json() -> Self {
        Self {
            media_type: "application/json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInputConfiguration {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub audio_type: String,
    pub encoding: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputConfiguration {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub voice_id: String,
    pub encoding: String,
    pub audio_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultInputConfiguration {
    pub tool_use_id: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub text_input_configuration: TextMediaConfiguration,
}

/// Media configuration attached to a `contentStart`; serialized as a sibling
/// key of the block's other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MediaConfig {
    #[serde(rename = "audioInputConfiguration")]
    Audio(AudioInputConfiguration),
    #[serde(rename = "textInputConfiguration")]
    Text(TextMediaConfiguration),
    #[serde(rename = "toolResultInputConfiguration")]
    ToolResult(ToolResultInputConfiguration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    pub prompt_name: String,
    pub content_name: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub interactive: bool,
    pub role: Role,
    #[serde(flatten)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_spec: ToolSpecWire,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecWire {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// The remote API expects the schema as a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSchema {
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolConfiguration {
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

/// One frame written to the remote duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    SessionStart {
        inference_configuration: InferenceConfiguration,
    },
    PromptStart {
        prompt_name: String,
        text_output_configuration: TextMediaConfiguration,
        audio_output_configuration: AudioOutputConfiguration,
        tool_use_output_configuration: TextMediaConfiguration,
        tool_configuration: ToolConfiguration,
    },
    ContentStart(ContentStart),
    TextInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    AudioInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    ToolResult {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    ContentEnd {
        prompt_name: String,
        content_name: String,
    },
    PromptEnd {
        prompt_name: String,
    },
    SessionEnd {},
}

/// How a frame affects the set of open content blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing<'a> {
    Opens(&'a str),
    Uses(&'a str),
    Closes(&'a str),
    Unscoped,
}

impl OutboundFrame {
    /// Wire name of the frame (`sessionStart`, `audioInput`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "sessionStart",
            Self::PromptStart { .. } => "promptStart",
            Self::ContentStart(_) => "contentStart",
            Self::TextInput { .. } => "textInput",
            Self::AudioInput { .. } => "audioInput",
            Self::ToolResult { .. } => "toolResult",
            Self::ContentEnd { .. } => "contentEnd",
            Self::PromptEnd { .. } => "promptEnd",
            Self::SessionEnd {} => "sessionEnd",
        }
    }

    /// Content block this frame opens, writes into, or closes.
    pub fn pairing(&self) -> Pairing<'_> {
        match self {
            Self::ContentStart(start) => Pairing::Opens(&start.content_name),
            Self::TextInput { content_name, .. }
            | Self::AudioInput { content_name, .. }
            | Self::ToolResult { content_name, .. } => Pairing::Uses(content_name),
            Self::ContentEnd { content_name, .. } => Pairing::Closes(content_name),
            _ => Pairing::Unscoped,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct Envelope<'a> {
    pub event: &'a OutboundFrame,
}
