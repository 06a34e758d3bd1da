//! Interactive text chat
//!
//! Reads user turns from stdin, prints agent events to stdout and reconnects
//! with exponential backoff when the connection drops. Reconnecting is this
//! loop's job; the core session never does it on its own.

use agentwire_core::{
    AgentConfig, AgentEvent, AgentSession, EventFilter, ServerErrorKind, StdoutEventHandler,
};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::local_tools::{Echo, LocalTime, Reminder};

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct ChatOptions {
    pub endpoint: String,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub agent_id: String,
    pub refresh_token: String,
    pub conversation_id: Option<String>,
    pub json_output: bool,
    pub show_speculative: bool,
    pub reconnect: bool,
}

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Quit,
    Status,
    Tools,
    Stop,
    Start,
    Help,
    Unknown(String),
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };
    match command.split_whitespace().next().unwrap_or_default() {
        "quit" | "exit" => Input::Quit,
        "status" => Input::Status,
        "tools" => Input::Tools,
        "stop" => Input::Stop,
        "start" => Input::Start,
        "help" => Input::Help,
        other => Input::Unknown(other.to_string()),
    }
}

/// Exponential backoff with jitter
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Delay before the next attempt: the current step plus up to 25% jitter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Started,
    Disconnected,
    ConversationFailed,
}

pub async fn run_chat(options: ChatOptions) -> Result<(), String> {
    let mut config = AgentConfig::text(options.endpoint);
    if let Some(token_url) = options.token_url {
        config.endpoint.token_url = token_url;
    }
    if let Some(client_id) = options.client_id {
        config.endpoint.client_id = client_id;
    }

    let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();
    let session = AgentSession::builder(config)
        .event_handler(
            EventFilter::Any,
            StdoutEventHandler::new(options.json_output).with_speculative(options.show_speculative),
        )
        .event_handler(EventFilter::Any, move |event: &AgentEvent| {
            let lifecycle = match event {
                AgentEvent::Start { .. } => Lifecycle::Started,
                AgentEvent::Disconnected => Lifecycle::Disconnected,
                AgentEvent::Error {
                    error: ServerErrorKind::AudioConversation,
                } => Lifecycle::ConversationFailed,
                _ => return,
            };
            let _ = lifecycle_tx.send(lifecycle);
        })
        .agent_id(options.agent_id)
        .refresh_token(options.refresh_token)
        .build()
        .await
        .map_err(|e| format!("Failed to create session: {e}"))?;

    let (reminder_tx, mut reminder_rx) = mpsc::unbounded_channel();
    session
        .register_tool("get_local_time", LocalTime)
        .await
        .map_err(|e| e.to_string())?;
    session
        .register_tool("set_reminder", Reminder::new(reminder_tx))
        .await
        .map_err(|e| e.to_string())?;
    session
        .register_tool("echo", Echo)
        .await
        .map_err(|e| e.to_string())?;

    session
        .start(options.conversation_id)
        .await
        .map_err(|e| format!("Failed to start session: {e}"))?;
    eprintln!("Type a message, or /help for commands.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
    let mut user_stopped = false;
    let mut reconnect_at: Option<Instant> = None;

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::Quit => break,
                    Input::Help => print_help(),
                    Input::Status => {
                        let id = session.conversation_id().await;
                        println!(
                            "state: {}, handshake: {:?}, conversation: {}",
                            session.connection_state(),
                            session.handshake_state(),
                            id.as_deref().unwrap_or("-")
                        );
                    }
                    Input::Tools => println!("tools: {}", session.tool_names().await.join(", ")),
                    Input::Stop => {
                        user_stopped = true;
                        reconnect_at = None;
                        if let Err(e) = session.stop().await {
                            eprintln!("Error: {e}");
                        }
                    }
                    Input::Start => {
                        user_stopped = false;
                        reconnect_at = None;
                        if let Err(e) = session.start(None).await {
                            eprintln!("Error: {e}");
                        }
                    }
                    Input::Unknown(command) => eprintln!("Unknown command: /{command}"),
                    Input::Message(text) => {
                        if let Err(e) = session.send_text(&text, SEND_TIMEOUT).await {
                            eprintln!("Message not sent: {e}");
                        }
                    }
                }
            }

            Some(lifecycle) = lifecycle_rx.recv() => match lifecycle {
                Lifecycle::Started => backoff.reset(),
                Lifecycle::ConversationFailed => {
                    warn!("Server ended the conversation, stopping session");
                    let _ = session.stop().await;
                    if options.reconnect && !user_stopped {
                        reconnect_at = Some(schedule(&mut backoff));
                    }
                }
                Lifecycle::Disconnected => {
                    if options.reconnect && !user_stopped && reconnect_at.is_none() {
                        reconnect_at = Some(schedule(&mut backoff));
                    }
                }
            },

            Some(task) = reminder_rx.recv() => println!("Reminder: {task}"),

            _ = sleep_until(reconnect_at), if reconnect_at.is_some() => {
                reconnect_at = None;
                if session.is_running().await {
                    continue;
                }
                if let Err(e) = session.start(None).await {
                    if e.is_retryable() {
                        reconnect_at = Some(schedule(&mut backoff));
                    } else {
                        eprintln!("Reconnect failed: {e}");
                    }
                }
            }
        }
    }

    session
        .deinit()
        .await
        .map_err(|e| format!("Failed to shut down session: {e}"))
}

fn schedule(backoff: &mut Backoff) -> Instant {
    let delay = backoff.next_delay();
    eprintln!("Reconnecting in {:.1}s", delay.as_secs_f32());
    Instant::now() + delay
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn print_help() {
    println!("/status  connection and conversation state");
    println!("/tools   registered local tools");
    println!("/stop    disconnect");
    println!("/start   connect again");
    println!("/quit    leave");
}
