//! Session state shared between the application, the connection tasks and
//! the message handlers.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::RwLock;

use crate::config::ConversationKind;

/// Connection lifecycle. Any failure or stop returns to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Authenticating = 2,
    HandshakePending = 3,
    /// Handshake acknowledged
    Connected = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::HandshakePending,
            4 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::HandshakePending => "handshake pending",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Set to `Done` by the first handshake ack and never reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Pending,
    Done,
}

pub struct SessionState {
    kind: ConversationKind,
    connection: AtomicU8,
    handshake_done: AtomicBool,
    conversation_id: RwLock<Option<String>>,
}

impl SessionState {
    pub fn new(kind: ConversationKind) -> Self {
        Self {
            kind,
            connection: AtomicU8::new(ConnectionState::Disconnected as u8),
            handshake_done: AtomicBool::new(false),
            conversation_id: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection.load(Ordering::Acquire))
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.connection.store(state as u8, Ordering::Release);
    }

    pub fn handshake_state(&self) -> HandshakeState {
        if self.handshake_done.load(Ordering::Acquire) {
            HandshakeState::Done
        } else {
            HandshakeState::Pending
        }
    }

    /// Returns `true` if this call moved the state to `Done`
    pub(crate) fn mark_handshake_done(&self) -> bool {
        !self.handshake_done.swap(true, Ordering::AcqRel)
    }

    pub async fn conversation_id(&self) -> Option<String> {
        self.conversation_id.read().await.clone()
    }

    /// Store a new conversation id, returning the one it replaced
    pub(crate) async fn set_conversation_id(&self, id: String) -> Option<String> {
        self.conversation_id.write().await.replace(id)
    }
}
