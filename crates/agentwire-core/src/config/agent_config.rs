use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::defaults;
use crate::error::{AgentError, Result};

/// Top-level configuration for an agent session
///
/// Provides centralized configuration management with:
/// - Serde support for loading from files/env
/// - Builder methods for customization
/// - Defaults for everything except the WebSocket endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    /// Where to connect and authenticate
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Conversation kind and audio parameters, fixed for the session's lifetime
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Queue sizes and timeouts
    #[serde(default)]
    pub queues: QueueConfig,
}

impl AgentConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// A text conversation against the given WebSocket URL template
    pub fn text(websocket_url: impl Into<String>) -> Self {
        Self::new().with_websocket_url(websocket_url)
    }

    /// A speech conversation against the given WebSocket URL template
    pub fn speech(websocket_url: impl Into<String>, upload: AudioConfig, download: AudioConfig) -> Self {
        Self::new()
            .with_websocket_url(websocket_url)
            .with_conversation(ConversationConfig::Speech { upload, download })
    }

    pub fn with_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint.websocket_url = url.into();
        self
    }

    pub fn with_conversation(mut self, conversation: ConversationConfig) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_queues(mut self, queues: QueueConfig) -> Self {
        self.queues = queues;
        self
    }

    /// Check everything that can be checked before connecting
    pub fn validate(&self) -> Result<()> {
        self.conversation.validate()?;
        self.queues.validate()
    }
}

/// Network endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// WebSocket URL; `{agent_id}` is replaced with the session's agent id
    #[serde(default)]
    pub websocket_url: String,

    /// OAuth token endpoint
    pub token_url: String,

    /// OAuth client id
    pub client_id: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            websocket_url: String::new(),
            token_url: defaults::DEFAULT_TOKEN_URL.to_string(),
            client_id: defaults::DEFAULT_CLIENT_ID.to_string(),
        }
    }
}

impl EndpointConfig {
    /// Resolve the WebSocket URL for an agent
    pub fn websocket_url_for(&self, agent_id: &str) -> Result<String> {
        if self.websocket_url.is_empty() {
            return Err(AgentError::InvalidArgument(
                "websocket_url is not configured".to_string(),
            ));
        }
        Ok(self
            .websocket_url
            .replace(defaults::AGENT_ID_PLACEHOLDER, agent_id))
    }
}

/// Conversation kind, without the audio parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Speech,
    Text,
}

impl ConversationKind {
    /// Value of `conversationType` in the handshake
    pub fn wire_name(self) -> &'static str {
        match self {
            ConversationKind::Speech => "audio",
            ConversationKind::Text => "text",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKind::Speech => write!(f, "speech"),
            ConversationKind::Text => write!(f, "text"),
        }
    }
}

/// Conversation kind plus, for speech, the negotiated audio formats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConversationConfig {
    #[default]
    Text,
    Speech {
        /// Audio sent by us
        upload: AudioConfig,
        /// Audio sent by the server
        download: AudioConfig,
    },
}

impl ConversationConfig {
    pub fn kind(&self) -> ConversationKind {
        match self {
            ConversationConfig::Text => ConversationKind::Text,
            ConversationConfig::Speech { .. } => ConversationKind::Speech,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let ConversationConfig::Speech { upload, download } = self {
            upload.validate("upload")?;
            download.validate("download")?;
        }
        Ok(())
    }
}

/// Audio encoding on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Opus,
    Pcm,
}

impl AudioFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            AudioFormat::Opus => "audio/opus",
            AudioFormat::Pcm => "audio/pcm",
        }
    }
}

/// One direction of the audio stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioConfig {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

impl AudioConfig {
    pub fn new(format: AudioFormat, sample_rate: u32, frame_duration_ms: u32) -> Self {
        Self {
            format,
            sample_rate,
            frame_duration_ms,
        }
    }

    pub fn opus(sample_rate: u32, frame_duration_ms: u32) -> Self {
        Self::new(AudioFormat::Opus, sample_rate, frame_duration_ms)
    }

    fn validate(&self, direction: &str) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(AgentError::InvalidArgument(format!(
                "{direction} sample rate must be non-zero"
            )));
        }
        if self.frame_duration_ms == 0 {
            return Err(AgentError::InvalidArgument(format!(
                "{direction} frame duration must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Queue capacities and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub outbound_capacity: usize,
    pub event_capacity: usize,
    pub event_post_timeout_ms: u64,
    pub marker_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: defaults::DEFAULT_OUTBOUND_CAPACITY,
            event_capacity: defaults::DEFAULT_EVENT_CAPACITY,
            event_post_timeout_ms: defaults::DEFAULT_EVENT_POST_TIMEOUT_MS,
            marker_timeout_ms: defaults::DEFAULT_MARKER_TIMEOUT_MS,
        }
    }
}

impl QueueConfig {
    pub fn event_post_timeout(&self) -> Duration {
        Duration::from_millis(self.event_post_timeout_ms)
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        // tokio's bounded channels panic on zero capacity
        if self.outbound_capacity == 0 || self.event_capacity == 0 {
            return Err(AgentError::InvalidArgument(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.conversation.kind(), ConversationKind::Text);
        assert_eq!(config.endpoint.token_url, defaults::DEFAULT_TOKEN_URL);
        assert_eq!(config.queues.event_post_timeout(), Duration::from_secs(1));
        assert_eq!(config.queues.marker_timeout(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_websocket_url_substitution() {
        let config = AgentConfig::text("wss://agents.example/{agent_id}/ws");
        assert_eq!(
            config.endpoint.websocket_url_for("a-42").unwrap(),
            "wss://agents.example/a-42/ws"
        );

        let fixed = AgentConfig::text("ws://127.0.0.1:9000");
        assert_eq!(
            fixed.endpoint.websocket_url_for("a-42").unwrap(),
            "ws://127.0.0.1:9000"
        );
    }

    #[test]
    fn test_missing_websocket_url() {
        let config = AgentConfig::default();
        assert!(matches!(
            config.endpoint.websocket_url_for("a-1"),
            Err(AgentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_speech_config_rejects_zero_values() {
        let zero_rate = ConversationConfig::Speech {
            upload: AudioConfig::opus(0, 60),
            download: AudioConfig::opus(24000, 20),
        };
        assert!(matches!(
            zero_rate.validate(),
            Err(AgentError::InvalidArgument(_))
        ));

        let zero_frame = ConversationConfig::Speech {
            upload: AudioConfig::opus(16000, 60),
            download: AudioConfig::opus(24000, 0),
        };
        assert!(zero_frame.validate().is_err());

        let ok = AgentConfig::speech(
            "wss://agents.example.com/{agent_id}",
            AudioConfig::opus(16000, 60),
            AudioConfig::opus(24000, 20),
        );
        assert!(ok.validate().is_ok());
        assert_eq!(ok.conversation.kind(), ConversationKind::Speech);
        assert_eq!(
            ok.endpoint.websocket_url,
            "wss://agents.example.com/{agent_id}"
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = AgentConfig::text("ws://x").with_queues(QueueConfig {
            outbound_capacity: 0,
            ..QueueConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conversation_config_serde() {
        let json = r#"{"kind":"speech","upload":{"format":"opus","sample_rate":16000,"frame_duration_ms":60},"download":{"format":"pcm","sample_rate":24000,"frame_duration_ms":20}}"#;
        let parsed: ConversationConfig = serde_json::from_str(json).unwrap();
        match parsed {
            ConversationConfig::Speech { upload, download } => {
                assert_eq!(upload.format, AudioFormat::Opus);
                assert_eq!(download.format.mime_type(), "audio/pcm");
            }
            _ => panic!("Wrong conversation kind"),
        }

        let text: ConversationConfig = serde_json::from_str(r#"{"kind":"text"}"#).unwrap();
        assert_eq!(text, ConversationConfig::Text);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(ConversationKind::Speech.wire_name(), "audio");
        assert_eq!(ConversationKind::Text.wire_name(), "text");
        assert_eq!(ConversationKind::Speech.to_string(), "speech");
    }
}
