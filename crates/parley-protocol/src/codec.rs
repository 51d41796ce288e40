use parley_types::Role;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{AudioInputConfig, AudioOutputConfig, InferenceConfig, ToolSpec};
use crate::error::ProtocolError;
use crate::frame::{
    AudioInputConfiguration, AudioOutputConfiguration, ContentKind, ContentStart, Envelope,
    InferenceConfiguration, InputSchema, MediaConfig, OutboundFrame, TextMediaConfiguration,
    ToolConfiguration, ToolEntry, ToolResultInputConfiguration, ToolSpecWire,
};

/// Generates a fresh content name. Content names are never reused.
pub fn new_content_name() -> String {
    Uuid::new_v4().to_string()
}

/// Serializes a frame inside its `{"event": ...}` envelope.
pub fn encode_frame(frame: &OutboundFrame) -> Result<String, ProtocolError> {
    serde_json::to_string(&Envelope { event: frame }).map_err(|source| ProtocolError::Encode {
        frame: frame.name(),
        source,
    })
}

pub fn build_session_start(inference: &InferenceConfig) -> OutboundFrame {
    OutboundFrame::SessionStart {
        inference_configuration: InferenceConfiguration {
            max_tokens: inference.max_tokens,
            top_p: inference.top_p,
            temperature: inference.temperature,
        },
    }
}

pub fn build_prompt_start(
    prompt_name: &str,
    audio_output: &AudioOutputConfig,
    tools: &[ToolSpec],
) -> OutboundFrame {
    let tools = tools
        .iter()
        .map(|spec| ToolEntry {
            tool_spec: ToolSpecWire {
                name: spec.name.clone(),
                description: spec.description.clone(),
                input_schema: InputSchema {
                    json: spec.input_schema.to_string(),
                },
            },
        })
        .collect();

    OutboundFrame::PromptStart {
        prompt_name: prompt_name.to_string(),
        text_output_configuration: TextMediaConfiguration::plain(),
        audio_output_configuration: AudioOutputConfiguration {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: audio_output.sample_rate_hertz,
            sample_size_bits: audio_output.sample_size_bits,
            channel_count: audio_output.channel_count,
            voice_id: audio_output.voice_id.clone(),
            encoding: "base64".to_string(),
            audio_type: "SPEECH".to_string(),
        },
        tool_use_output_configuration: TextMediaConfiguration::json(),
        tool_configuration: ToolConfiguration { tools },
    }
}

impl MediaConfig {
    pub fn audio(input: &AudioInputConfig) -> Self {
        Self::Audio(AudioInputConfiguration {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: input.sample_rate_hertz,
            sample_size_bits: input.sample_size_bits,
            channel_count: input.channel_count,
            audio_type: "SPEECH".to_string(),
            encoding: "base64".to_string(),
        })
    }

    pub fn text() -> Self {
        Self::Text(TextMediaConfiguration::plain())
    }

    pub fn tool_result(tool_use_id: &str) -> Self {
        Self::ToolResult(ToolResultInputConfiguration {
            tool_use_id: tool_use_id.to_string(),
            kind: ContentKind::Text,
            text_input_configuration: TextMediaConfiguration::plain(),
        })
    }
}

pub fn build_content_start(
    prompt_name: &str,
    content_name: &str,
    kind: ContentKind,
    role: Role,
    interactive: bool,
    media: MediaConfig,
) -> OutboundFrame {
    OutboundFrame::ContentStart(ContentStart {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
        kind,
        interactive,
        role,
        media,
    })
}

pub fn build_text_input(prompt_name: &str, content_name: &str, text: &str) -> OutboundFrame {
    OutboundFrame::TextInput {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
        content: text.to_string(),
    }
}

/// `payload` must already be base64 encoded.
pub fn build_audio_input(prompt_name: &str, content_name: &str, payload: &str) -> OutboundFrame {
    OutboundFrame::AudioInput {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
        content: payload.to_string(),
    }
}

/// Tool results travel as JSON text.
pub fn build_tool_result(prompt_name: &str, content_name: &str, result: &Value) -> OutboundFrame {
    OutboundFrame::ToolResult {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
        content: result.to_string(),
    }
}

pub fn build_content_end(prompt_name: &str, content_name: &str) -> OutboundFrame {
    OutboundFrame::ContentEnd {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
    }
}

pub fn build_prompt_end(prompt_name: &str) -> OutboundFrame {
    OutboundFrame::PromptEnd {
        prompt_name: prompt_name.to_string(),
    }
}

pub fn build_session_end() -> OutboundFrame {
    OutboundFrame::SessionEnd {}
}
