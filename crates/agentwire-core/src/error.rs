//! Error types
//!
//! One `thiserror` enum per layer. [`AgentError`] is what the public session
//! API returns; the layer errors convert into it with `?`.

use thiserror::Error;

use crate::auth::AuthError;
use crate::transport::TransportError;

/// Errors raised while decoding or encoding wire messages
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not valid JSON
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A required field is absent or has the wrong JSON kind
    #[error("Missing field: {0}")]
    MissingField(String),

    /// A field is present but its value is not acceptable
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Tool parameter value is neither a string, a number nor a bool
    #[error("Unsupported value type for tool parameter '{0}'")]
    UnsupportedParameter(String),
}

impl ProtocolError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::MissingField(field.to_string())
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Session-level error type
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad input to a public call. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid for the current session, handshake or conversation kind
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Malformed or incomplete wire payload
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A resource could not be acquired (queue closed, task could not be scheduled)
    #[error("Resource unavailable: {0}")]
    Resource(String),

    /// Unknown tool name or event handler
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate registration
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A queue or post operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl AgentError {
    /// Whether an application-level retry can reasonably succeed.
    ///
    /// The core never retries on its own; this only informs reconnect policies.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Timeout(_) | AgentError::Transport(_) => true,
            AgentError::Auth(err) => matches!(err, AuthError::Request(_)),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(
            ProtocolError::missing("type").to_string(),
            "Missing field: type"
        );
        assert_eq!(
            ProtocolError::invalid("role", "unknown role 'system'").to_string(),
            "Invalid value for 'role': unknown role 'system'"
        );
    }

    #[test]
    fn test_protocol_error_converts_into_agent_error() {
        let err: AgentError = ProtocolError::Malformed("eof".to_string()).into();
        assert!(matches!(err, AgentError::Protocol(ProtocolError::Malformed(_))));
        assert_eq!(err.to_string(), "Malformed message: eof");
    }

    #[test]
    fn test_is_retryable() {
        assert!(AgentError::Timeout("queue".into()).is_retryable());
        assert!(AgentError::Transport(TransportError::Closed).is_retryable());
        assert!(AgentError::Auth(AuthError::Request("dns".into())).is_retryable());
        assert!(!AgentError::Auth(AuthError::InvalidResponse("401".into())).is_retryable());
        assert!(!AgentError::InvalidState("text only".into()).is_retryable());
        assert!(!AgentError::NotFound("tool".into()).is_retryable());
    }
}
