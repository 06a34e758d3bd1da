//! Session configuration
//!
//! This module defines configuration types and default values:
//! - `agent_config`: Configuration structures
//! - `defaults`: Default configuration values

pub mod agent_config;
pub mod defaults;

pub use agent_config::{
    AgentConfig, AudioConfig, AudioFormat, ConversationConfig, ConversationKind, EndpointConfig,
    QueueConfig,
};
