//! Wire Protocol
//!
//! JSON envelopes exchanged with the agent server over text frames:
//! `{type, content_type, content, metadata?}`. Binary frames carry raw speech
//! and have no envelope.

use serde_json::{json, Map, Value};

use crate::config::ConversationConfig;
use crate::error::{ProtocolError, Result};
use crate::tools::{ToolCall, ToolParam, ToolParamValue, ToolStatus};

/// Message type strings
pub mod message_type {
    pub const HANDSHAKE: &str = "handshake";
    pub const HANDSHAKE_ACK: &str = "handshake_ack";
    pub const AUDIO_STREAM_START: &str = "audio_stream_start";
    pub const AUDIO_STREAM_END: &str = "audio_stream_end";
    pub const TRANSACTION_END: &str = "transaction_end";
    pub const BARGE_IN: &str = "barge_in";
    pub const USAGE_INFO: &str = "usage_info";
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
    pub const THINKING: &str = "thinking";
    pub const ERROR: &str = "error";
    pub const TOOL_CALL_INFO: &str = "tool_call_info";
    pub const TOOL_REQUEST: &str = "tool_request";
    pub const TOOL_RESPONSE: &str = "tool_response";
    pub const TOOL_RESULT_INFO: &str = "tool_result_info";
}

/// A parsed inbound message. `content` and `metadata` are validated by the
/// handler for `kind`, not here.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub content: Option<Value>,
    pub metadata: Option<Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, content: Option<Value>, metadata: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            content,
            metadata,
        }
    }

    /// `content` as an object, or `MissingField("content")`
    pub fn content_object(&self) -> std::result::Result<&Map<String, Value>, ProtocolError> {
        self.content
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| ProtocolError::missing("content"))
    }

    /// `content` as a string, or `MissingField("content")`
    pub fn content_str(&self) -> std::result::Result<&str, ProtocolError> {
        self.content
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::missing("content"))
    }

    /// A string field of `metadata`, if both exist
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Parse a text frame into an [`Envelope`]
pub fn parse(raw: &str) -> std::result::Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::missing("type"));
    };

    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ProtocolError::missing("type")),
    };
    let content = object.remove("content").filter(|v| !v.is_null());
    let metadata = object.remove("metadata").filter(|v| !v.is_null());

    Ok(Envelope::new(kind, content, metadata))
}

/// Handshake request; resumes `conversation_id` when given
pub fn encode_handshake(
    conversation_id: Option<&str>,
    conversation: &ConversationConfig,
) -> Result<String> {
    conversation.validate()?;

    let mut content = Map::new();
    if let Some(id) = conversation_id {
        content.insert("conversationId".to_string(), json!(id));
    }
    content.insert(
        "conversationType".to_string(),
        json!(conversation.kind().wire_name()),
    );
    if let ConversationConfig::Speech { upload, download } = conversation {
        content.insert(
            "audioConfiguration".to_string(),
            json!({
                "input": {
                    "format": upload.format.mime_type(),
                    "sampleRate": upload.sample_rate,
                    "frameDurationMs": upload.frame_duration_ms,
                },
                "output": {
                    "format": download.format.mime_type(),
                    "sampleRate": download.sample_rate,
                    "frameDurationMs": download.frame_duration_ms,
                },
            }),
        );
    }

    Ok(json!({
        "type": message_type::HANDSHAKE,
        "content": Value::Object(content),
        "content_type": "json",
    })
    .to_string())
}

/// A user text turn
pub fn encode_text_message(text: &str) -> String {
    json!({
        "type": message_type::USER,
        "content_type": "text",
        "content": text,
    })
    .to_string()
}

/// Response to a tool request. `result` is omitted when `None`.
pub fn encode_tool_response(request_id: &str, status: ToolStatus, result: Option<&str>) -> String {
    let mut outcome = Map::new();
    outcome.insert("status".to_string(), json!(status.as_str()));
    if let Some(result) = result {
        outcome.insert("result".to_string(), json!(result));
    }

    json!({
        "type": message_type::TOOL_RESPONSE,
        "content_type": { "type": "json" },
        "content": {
            "request_id": request_id,
            "result": Value::Object(outcome),
        },
    })
    .to_string()
}

/// Boundary of a user speech sub-conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechMarker {
    Start,
    End,
}

/// Speech start/end marker. The server requires `metadata.role` and an
/// empty `content` object.
pub fn encode_speech_marker(marker: SpeechMarker) -> String {
    let kind = match marker {
        SpeechMarker::Start => message_type::AUDIO_STREAM_START,
        SpeechMarker::End => message_type::AUDIO_STREAM_END,
    };
    json!({
        "type": kind,
        "content_type": "json",
        "metadata": { "role": "user" },
        "content": {},
    })
    .to_string()
}

/// Extract a [`ToolCall`] from the content of a `tool_request`
///
/// Parameters keep the order of the `input` object. Any value that is not a
/// string, number or bool fails the whole request.
pub fn parse_tool_request(content: &Map<String, Value>) -> std::result::Result<ToolCall, ProtocolError> {
    let request_id = required_str(content, "request_id")?;
    let tool_name = required_str(content, "tool_name")?;
    let input = content
        .get("input")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::missing("input"))?;

    let params = input
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => ToolParamValue::Str(s.clone()),
                Value::Bool(b) => ToolParamValue::Bool(*b),
                Value::Number(n) => ToolParamValue::Int(
                    n.as_i64()
                        .or_else(|| n.as_f64().map(|f| f as i64))
                        .ok_or_else(|| ProtocolError::UnsupportedParameter(name.clone()))?,
                ),
                _ => return Err(ProtocolError::UnsupportedParameter(name.clone())),
            };
            Ok(ToolParam::new(name.clone(), value))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ToolCall {
        request_id,
        tool_name,
        params,
    })
}

fn required_str(object: &Map<String, Value>, field: &str) -> std::result::Result<String, ProtocolError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::missing(field))
}
