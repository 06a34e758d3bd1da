//! agentwire Core Library
//!
//! Client side of a persistent agent session: a WebSocket connection to a
//! cloud AI agent carrying JSON control messages and raw speech audio.
//!
//! # Modules
//!
//! - [`session`] - Session handle, connection lifecycle and public API
//! - [`protocol`] - Wire envelopes, encoders and parsers
//! - [`dispatcher`] - Message type to handler table
//! - [`tools`] - Local tool registry and asynchronous execution
//! - [`events`] - Typed events and the delivery task
//! - [`sinks`] - Ready-made event handlers
//! - [`transport`] - Connector abstraction, outbound queue, in-memory transport
//! - [`websocket`] - WebSocket connector (feature `websocket`)
//! - [`auth`] - Refresh-token to access-token exchange
//! - [`state`] - Connection and handshake state
//! - [`config`] - Session configuration
//! - [`error`] - Error types

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod sinks;
pub mod state;
pub mod tools;
pub mod transport;
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-export commonly used types
pub use auth::{AuthError, OAuthClient, StaticTokenProvider, TokenProvider};
pub use config::{
    AgentConfig, AudioConfig, AudioFormat, ConversationConfig, ConversationKind, EndpointConfig,
    QueueConfig,
};
pub use dispatcher::{DispatchContext, Dispatcher, MessageHandler};
pub use error::{AgentError, ProtocolError, Result};
pub use events::{
    AgentEvent, EventBus, EventFilter, EventHandler, EventKind, GenerationStage, HandlerId,
    MessageRole, ServerErrorKind,
};
pub use protocol::Envelope;
pub use session::{AgentSession, SessionBuilder};
pub use sinks::{NoOpEventHandler, StdoutEventHandler};
pub use state::{ConnectionState, HandshakeState};
pub use tools::{
    find_param, tool_fn, LocalTool, ToolCall, ToolOutput, ToolParam, ToolParamType,
    ToolParamValue, ToolStatus,
};
pub use transport::{Connector, Frame, MemoryConnector, TransportError};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
