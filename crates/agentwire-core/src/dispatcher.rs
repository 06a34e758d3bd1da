//! Message Dispatcher
//!
//! Maps the `type` of each inbound envelope to a handler. Types without a
//! handler are logged and skipped so newer servers can add message types.
//! A failing handler only loses its own message.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{ProtocolError, Result};
use crate::events::{AgentEvent, EventBus, GenerationStage, MessageRole, ServerErrorKind};
use crate::protocol::{self, message_type, Envelope};
use crate::state::{ConnectionState, SessionState};
use crate::tools::ToolEngine;

/// Everything a handler may touch
#[derive(Clone)]
pub struct DispatchContext {
    state: Arc<SessionState>,
    events: EventBus,
    tools: Arc<ToolEngine>,
}

impl DispatchContext {
    pub fn new(state: Arc<SessionState>, events: EventBus, tools: Arc<ToolEngine>) -> Self {
        Self {
            state,
            events,
            tools,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tools(&self) -> &ToolEngine {
        &self.tools
    }
}

/// Handles one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &DispatchContext, envelope: &Envelope) -> Result<()>;
}

/// Handlers for the message types the protocol defines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinHandler {
    HandshakeAck,
    Transcript,
    Thinking,
    Error,
    SpeechStart,
    SpeechEnd,
    ToolRequest,
    /// Accepted and dropped
    Ignore,
}

#[async_trait]
impl MessageHandler for BuiltinHandler {
    async fn handle(&self, ctx: &DispatchContext, envelope: &Envelope) -> Result<()> {
        match self {
            BuiltinHandler::HandshakeAck => handle_handshake_ack(ctx, envelope).await,
            BuiltinHandler::Transcript => handle_transcript(ctx, envelope).await,
            BuiltinHandler::Thinking => {
                let thought = envelope.content_str()?.to_string();
                ctx.events.post(AgentEvent::Thinking { thought }).await
            }
            BuiltinHandler::Error => handle_error(ctx, envelope).await,
            BuiltinHandler::SpeechStart => ctx.events.post(AgentEvent::SpeechStart).await,
            BuiltinHandler::SpeechEnd => ctx.events.post(AgentEvent::SpeechEnd).await,
            BuiltinHandler::ToolRequest => handle_tool_request(ctx, envelope).await,
            BuiltinHandler::Ignore => {
                debug!("Ignoring {} message", envelope.kind);
                Ok(())
            }
        }
    }
}

/// Type string to handler table
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

impl Dispatcher {
    /// A dispatcher with no handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_default_handlers() -> Self {
        let mut dispatcher = Self::empty();
        let table = [
            (message_type::HANDSHAKE_ACK, BuiltinHandler::HandshakeAck),
            (message_type::USER, BuiltinHandler::Transcript),
            (message_type::ASSISTANT, BuiltinHandler::Transcript),
            (message_type::THINKING, BuiltinHandler::Thinking),
            (message_type::ERROR, BuiltinHandler::Error),
            (message_type::AUDIO_STREAM_START, BuiltinHandler::SpeechStart),
            (message_type::AUDIO_STREAM_END, BuiltinHandler::SpeechEnd),
            (message_type::TOOL_REQUEST, BuiltinHandler::ToolRequest),
            (message_type::USAGE_INFO, BuiltinHandler::Ignore),
            (message_type::TOOL_CALL_INFO, BuiltinHandler::Ignore),
            (message_type::TOOL_RESULT_INFO, BuiltinHandler::Ignore),
            (message_type::TRANSACTION_END, BuiltinHandler::Ignore),
            (message_type::BARGE_IN, BuiltinHandler::Ignore),
        ];
        for (kind, handler) in table {
            dispatcher.register(kind, handler);
        }
        dispatcher
    }

    /// Install `handler` for `kind`, replacing any previous one
    pub fn register<H>(&mut self, kind: impl Into<String>, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Run the handler for `envelope.kind`; unknown types are not an error
    pub async fn dispatch(&self, ctx: &DispatchContext, envelope: &Envelope) -> Result<()> {
        match self.handlers.get(envelope.kind.as_str()) {
            Some(handler) => handler.handle(ctx, envelope).await,
            None => {
                warn!("Unhandled message type: {}", envelope.kind);
                Ok(())
            }
        }
    }

    /// Parse a text frame and dispatch it
    pub async fn process(&self, ctx: &DispatchContext, raw: &str) -> Result<()> {
        let envelope = protocol::parse(raw)?;
        self.dispatch(ctx, &envelope).await
    }
}

async fn handle_handshake_ack(ctx: &DispatchContext, envelope: &Envelope) -> Result<()> {
    let content = envelope.content_object()?;
    // An ack with content completes the handshake even without an id.
    ctx.state.mark_handshake_done();

    let conversation_id = content
        .get("conversationId")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::missing("conversationId"))?
        .to_string();

    if let Some(previous) = ctx.state.set_conversation_id(conversation_id.clone()).await {
        if previous != conversation_id {
            warn!(
                "Conversation id changed from {} to {}",
                previous, conversation_id
            );
        }
    }
    ctx.state.set_connection_state(ConnectionState::Connected);
    info!("Handshake acknowledged, conversation {}", conversation_id);

    ctx.events
        .post(AgentEvent::Start {
            conversation_id: Some(conversation_id),
        })
        .await
}

async fn handle_transcript(ctx: &DispatchContext, envelope: &Envelope) -> Result<()> {
    let text = envelope.content_str()?;
    let role = match envelope.metadata_str("role") {
        Some("user") => MessageRole::User,
        Some("assistant") => MessageRole::Assistant,
        Some(other) => {
            return Err(ProtocolError::invalid("metadata.role", format!("unknown role '{other}'")).into())
        }
        None => return Err(ProtocolError::missing("metadata.role").into()),
    };
    let generation_stage = match role {
        MessageRole::Assistant => {
            GenerationStage::from_wire(envelope.metadata_str("generation_stage"))
        }
        MessageRole::User => GenerationStage::Unknown,
    };

    ctx.events
        .post(AgentEvent::Text {
            text: text.to_string(),
            role,
            generation_stage,
        })
        .await
}

async fn handle_error(ctx: &DispatchContext, envelope: &Envelope) -> Result<()> {
    let content = envelope
        .content
        .as_ref()
        .ok_or_else(|| ProtocolError::missing("content"))?;

    // Error details usually arrive as a JSON document inside a string.
    let details = match content {
        Value::String(raw) => serde_json::from_str::<Value>(raw).ok(),
        other => Some(other.clone()),
    };
    error!("Agent error: {}", content);

    let kind = details
        .as_ref()
        .and_then(|d| d.get("code"))
        .and_then(Value::as_str)
        .and_then(ServerErrorKind::from_code);

    match kind {
        Some(error) => ctx.events.post(AgentEvent::Error { error }).await,
        None => Ok(()),
    }
}

async fn handle_tool_request(ctx: &DispatchContext, envelope: &Envelope) -> Result<()> {
    let call = protocol::parse_tool_request(envelope.content_object()?)?;
    let tool_name = call.tool_name.clone();
    match ctx.tools.execute(call).await {
        Ok(task) => {
            debug!(request_id = %task.request_id(), tool = %tool_name, "Tool dispatched");
            Ok(())
        }
        Err(e) => {
            warn!(tool = %tool_name, "Tool request not executed: {}", e);
            Err(e)
        }
    }
}
