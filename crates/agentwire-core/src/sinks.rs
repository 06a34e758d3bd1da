//! Ready-made event handlers
//!
//! [`NoOpEventHandler`] for sessions nobody listens to and
//! [`StdoutEventHandler`] for CLI mode.

use chrono::{DateTime, Local};

use crate::events::{AgentEvent, EventHandler, GenerationStage, MessageRole};

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventHandler;

impl EventHandler for NoOpEventHandler {
    fn on_event(&self, _event: &AgentEvent) {}
}

/// Stdout event handler for CLI mode - prints events to console
#[derive(Debug, Default, Clone)]
pub struct StdoutEventHandler {
    /// Whether to print in JSON format
    pub json_output: bool,

    /// Whether to print speculative assistant fragments
    pub show_speculative: bool,
}

impl StdoutEventHandler {
    pub fn new(json_output: bool) -> Self {
        Self {
            json_output,
            show_speculative: false,
        }
    }

    pub fn with_speculative(mut self, show: bool) -> Self {
        self.show_speculative = show;
        self
    }

    /// The line printed for `event`, or `None` if it is filtered out
    pub fn render(&self, event: &AgentEvent, at: DateTime<Local>) -> Option<String> {
        if let AgentEvent::Text {
            generation_stage: GenerationStage::Speculative,
            ..
        } = event
        {
            if !self.show_speculative {
                return None;
            }
        }

        if self.json_output {
            return serde_json::to_string(event).ok();
        }

        let line = match event {
            AgentEvent::Text {
                text,
                role,
                generation_stage,
            } => {
                let who = match role {
                    MessageRole::User => "you",
                    MessageRole::Assistant => "agent",
                };
                let marker = match generation_stage {
                    GenerationStage::Speculative => "~",
                    _ => ">",
                };
                format!("{who} {marker} {text}")
            }
            AgentEvent::Thinking { thought } => format!("(thinking) {thought}"),
            AgentEvent::Start { conversation_id } => format!(
                "Conversation started: {}",
                conversation_id.as_deref().unwrap_or("-")
            ),
            AgentEvent::Error { error } => format!("Server error: {error:?}"),
            AgentEvent::Speech { data } => format!("Speech frame ({} bytes)", data.len()),
            other => format!("[{}]", other.kind()),
        };
        Some(format!("[{}] {}", format_timestamp(at), line))
    }
}

impl EventHandler for StdoutEventHandler {
    fn on_event(&self, event: &AgentEvent) {
        if let Some(line) = self.render(event, Local::now()) {
            println!("{line}");
        }
    }
}

fn format_timestamp(at: DateTime<Local>) -> String {
    at.format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap()
    }

    fn assistant(text: &str, stage: GenerationStage) -> AgentEvent {
        AgentEvent::Text {
            text: text.to_string(),
            role: MessageRole::Assistant,
            generation_stage: stage,
        }
    }

    #[test]
    fn test_noop_handler() {
        NoOpEventHandler.on_event(&AgentEvent::Connected);
    }

    #[test]
    fn test_render_text() {
        let handler = StdoutEventHandler::new(false);
        assert_eq!(
            handler
                .render(&assistant("Hello", GenerationStage::Final), noon())
                .unwrap(),
            "[12:00:01.000] agent > Hello"
        );
        assert_eq!(
            handler.render(&AgentEvent::Connected, noon()).unwrap(),
            "[12:00:01.000] [connected]"
        );
    }

    #[test]
    fn test_speculative_hidden_by_default() {
        let event = assistant("Hel", GenerationStage::Speculative);
        assert!(StdoutEventHandler::new(false).render(&event, noon()).is_none());

        let shown = StdoutEventHandler::new(false)
            .with_speculative(true)
            .render(&event, noon())
            .unwrap();
        assert!(shown.ends_with("agent ~ Hel"));
    }

    #[test]
    fn test_render_json() {
        let handler = StdoutEventHandler::new(true);
        let line = handler
            .render(
                &AgentEvent::Start {
                    conversation_id: Some("c-1".to_string()),
                },
                noon(),
            )
            .unwrap();
        assert_eq!(line, r#"{"event":"start","conversation_id":"c-1"}"#);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(noon()), "12:00:01.000");
    }
}
