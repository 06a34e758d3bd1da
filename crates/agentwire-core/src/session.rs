//! Agent Session
//!
//! The application-facing handle. A session owns the event bus, the tool
//! registry, the outbound queue and, while started, one connection task that
//! authenticates, connects, writes the handshake and then runs a reader and a
//! writer until the server closes or `stop` is called.
//!
//! The core never reconnects on its own: when the connection ends a
//! `Disconnected` event is posted and the application decides what to do.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{OAuthClient, TokenProvider};
use crate::config::{AgentConfig, ConversationKind};
use crate::dispatcher::{DispatchContext, Dispatcher, MessageHandler};
use crate::error::{AgentError, Result};
use crate::events::{
    AgentEvent, EventBus, EventFilter, EventHandler, EventLoopHandle, HandlerId,
};
use crate::protocol::{encode_handshake, encode_speech_marker, encode_text_message, SpeechMarker};
use crate::state::{ConnectionState, HandshakeState, SessionState};
use crate::tools::{LocalTool, ToolEngine};
use crate::transport::{outbound_queue, Connection, Connector, Frame, OutboundSender, TransportError};

#[derive(Debug, Default, Clone)]
struct Credentials {
    agent_id: Option<String>,
    refresh_token: Option<String>,
}

/// Configures and creates an [`AgentSession`]
pub struct SessionBuilder {
    config: AgentConfig,
    connector: Option<Arc<dyn Connector>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    dispatcher: Dispatcher,
    handlers: Vec<(EventFilter, Arc<dyn EventHandler>)>,
    credentials: Credentials,
}

impl SessionBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            connector: None,
            token_provider: None,
            dispatcher: Dispatcher::with_default_handlers(),
            handlers: Vec::new(),
            credentials: Credentials::default(),
        }
    }

    /// Transport to use instead of the WebSocket connector
    pub fn connector<C: Connector + 'static>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Token source to use instead of the OAuth client
    pub fn token_provider<P: TokenProvider + 'static>(mut self, provider: P) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    /// Handle an additional message type, or replace a built-in handler
    pub fn message_handler<H>(mut self, kind: impl Into<String>, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.dispatcher.register(kind, handler);
        self
    }

    /// Registered before `Init` is posted, so the handler sees it
    pub fn event_handler<H>(mut self, filter: impl Into<EventFilter>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.handlers.push((filter.into(), Arc::new(handler)));
        self
    }

    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.credentials.agent_id = Some(agent_id.into());
        self
    }

    pub fn refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.credentials.refresh_token = Some(refresh_token.into());
        self
    }

    /// Validate the configuration, start event delivery and post `Init`
    pub async fn build(self) -> Result<AgentSession> {
        self.config.validate()?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let token_provider: Arc<dyn TokenProvider> = match self.token_provider {
            Some(provider) => provider,
            None => Arc::new(OAuthClient::from_endpoint(&self.config.endpoint)?),
        };

        let queues = &self.config.queues;
        let (events, event_loop) =
            EventBus::new(queues.event_capacity, queues.event_post_timeout());
        for (filter, handler) in self.handlers {
            events.register_shared(filter, handler).await;
        }
        let event_loop = event_loop.spawn();

        let (outbound, outbound_rx) = outbound_queue(queues.outbound_capacity);
        let state = Arc::new(SessionState::new(self.config.conversation.kind()));
        let tools = Arc::new(ToolEngine::new(outbound.clone()));

        let session = AgentSession {
            ctx: DispatchContext::new(Arc::clone(&state), events.clone(), Arc::clone(&tools)),
            config: self.config,
            state,
            events,
            event_loop: Some(event_loop),
            tools,
            dispatcher: Arc::new(self.dispatcher),
            outbound,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            connector,
            token_provider,
            credentials: RwLock::new(self.credentials),
            runner: Mutex::new(None),
        };

        info!(kind = %session.conversation_kind(), "Agent session initialized");
        if let Err(e) = session.events.post(AgentEvent::Init).await {
            warn!("Init event not delivered: {}", e);
        }
        Ok(session)
    }
}

#[cfg(feature = "websocket")]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(crate::websocket::WebSocketConnector::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_connector() -> Result<Arc<dyn Connector>> {
    Err(AgentError::InvalidArgument(
        "no connector configured and the websocket feature is disabled".to_string(),
    ))
}

struct Runner {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// A conversation with the cloud agent
pub struct AgentSession {
    config: AgentConfig,
    state: Arc<SessionState>,
    events: EventBus,
    event_loop: Option<EventLoopHandle>,
    tools: Arc<ToolEngine>,
    dispatcher: Arc<Dispatcher>,
    ctx: DispatchContext,
    outbound: OutboundSender,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
    connector: Arc<dyn Connector>,
    token_provider: Arc<dyn TokenProvider>,
    credentials: RwLock<Credentials>,
    runner: Mutex<Option<Runner>>,
}

impl AgentSession {
    /// Start configuring a session
    pub fn builder(config: AgentConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Session with the default WebSocket connector and OAuth client
    pub async fn new(config: AgentConfig) -> Result<Self> {
        SessionBuilder::new(config).build().await
    }

    /// Configuration the session was built with
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Text or speech, fixed at build time
    pub fn conversation_kind(&self) -> ConversationKind {
        self.state.kind()
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// Whether the current conversation has been acknowledged
    pub fn handshake_state(&self) -> HandshakeState {
        self.state.handshake_state()
    }

    /// Id from the last handshake ack, if any
    pub async fn conversation_id(&self) -> Option<String> {
        self.state.conversation_id().await
    }

    /// Whether a connection task exists and has not finished
    pub async fn is_running(&self) -> bool {
        self.runner
            .lock()
            .await
            .as_ref()
            .is_some_and(|runner| !runner.handle.is_finished())
    }

    /// Agent to connect to; used by the next `start`
    pub async fn set_agent_id(&self, agent_id: impl Into<String>) -> Result<()> {
        let agent_id = agent_id.into();
        if agent_id.is_empty() {
            return Err(AgentError::InvalidArgument("agent id must not be empty".to_string()));
        }
        self.credentials.write().await.agent_id = Some(agent_id);
        Ok(())
    }

    /// Refresh token traded for an access token on every `start`
    pub async fn set_refresh_token(&self, refresh_token: impl Into<String>) -> Result<()> {
        let refresh_token = refresh_token.into();
        if refresh_token.is_empty() {
            return Err(AgentError::InvalidArgument(
                "refresh token must not be empty".to_string(),
            ));
        }
        self.credentials.write().await.refresh_token = Some(refresh_token);
        Ok(())
    }

    /// Subscribe to events; the handler sees events posted after this returns
    pub async fn register_event_handler<H>(
        &self,
        filter: impl Into<EventFilter>,
        handler: H,
    ) -> HandlerId
    where
        H: EventHandler + 'static,
    {
        self.events.register(filter, handler).await
    }

    /// Remove a subscription; `NotFound` for an unknown id
    pub async fn unregister_event_handler(&self, id: HandlerId) -> Result<()> {
        self.events.unregister(id).await
    }

    /// Make a local tool callable by the agent; names are unique
    pub async fn register_tool<T>(&self, name: impl Into<String>, tool: T) -> Result<()>
    where
        T: LocalTool + 'static,
    {
        self.tools.register_tool(name, tool).await
    }

    /// Remove a local tool; `NotFound` for an unknown name
    pub async fn unregister_tool(&self, name: &str) -> Result<()> {
        self.tools.unregister_tool(name).await
    }

    /// Registered tool names, sorted
    pub async fn tool_names(&self) -> Vec<String> {
        self.tools.tool_names().await
    }

    /// Connect in the background
    ///
    /// Returns once the connection task is spawned; the handshake ack arrives
    /// later as a `Start` event. Without `conversation_id` the session resumes
    /// the conversation of its last handshake ack, if any.
    pub async fn start(&self, conversation_id: Option<String>) -> Result<()> {
        let mut runner = self.runner.lock().await;
        if runner
            .as_ref()
            .is_some_and(|runner| !runner.handle.is_finished())
        {
            return Err(TransportError::AlreadyRunning.into());
        }

        let credentials = self.credentials.read().await.clone();
        let (Some(agent_id), Some(refresh_token)) = (credentials.agent_id, credentials.refresh_token)
        else {
            return Err(AgentError::InvalidState(
                "agent id and refresh token must be set before start".to_string(),
            ));
        };

        let url = self.config.endpoint.websocket_url_for(&agent_id)?;
        let conversation_id = match conversation_id {
            Some(id) => Some(id),
            None => self.state.conversation_id().await,
        };
        let handshake = encode_handshake(conversation_id.as_deref(), &self.config.conversation)?;

        let link = Link {
            ctx: self.ctx.clone(),
            state: Arc::clone(&self.state),
            dispatcher: Arc::clone(&self.dispatcher),
            outbound_rx: Arc::clone(&self.outbound_rx),
            connector: Arc::clone(&self.connector),
            token_provider: Arc::clone(&self.token_provider),
            url,
            refresh_token,
            handshake,
        };

        info!(agent_id = %agent_id, resume = ?conversation_id, "Starting agent connection");
        self.state.set_connection_state(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(link.run(shutdown_rx));
        *runner = Some(Runner {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the connection task and wait for it
    ///
    /// Frames still queued are abandoned. Posts `Stop`.
    pub async fn stop(&self) -> Result<()> {
        let runner = self
            .runner
            .lock()
            .await
            .take()
            .ok_or(TransportError::NotRunning)?;

        let _ = runner.shutdown_tx.send(());
        if let Err(e) = runner.handle.await {
            error!("Connection task failed: {}", e);
        }

        let mut rx = self.outbound_rx.lock().await;
        let mut abandoned = 0usize;
        while rx.try_recv().is_ok() {
            abandoned += 1;
        }
        drop(rx);
        if abandoned > 0 {
            warn!("Abandoned {} queued frame(s) on stop", abandoned);
        }

        self.state.set_connection_state(ConnectionState::Disconnected);
        info!("Agent session stopped");
        if let Err(e) = self.events.post(AgentEvent::Stop).await {
            warn!("Stop event not delivered: {}", e);
        }
        Ok(())
    }

    /// Stop if running, post `Deinit`, deliver what is still queued and
    /// shut event delivery down
    pub async fn deinit(mut self) -> Result<()> {
        match self.stop().await {
            Ok(()) | Err(AgentError::Transport(TransportError::NotRunning)) => {}
            Err(e) => return Err(e),
        }
        if let Err(e) = self.events.post(AgentEvent::Deinit).await {
            warn!("Deinit event not delivered: {}", e);
        }
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.shutdown().await;
        }
        info!("Agent session deinitialized");
        Ok(())
    }

    /// Queue raw audio; speech conversations only
    pub async fn send_speech(&self, data: impl Into<Bytes>, timeout: Duration) -> Result<()> {
        self.require_kind(ConversationKind::Speech, "send_speech")?;
        let data = data.into();
        if data.is_empty() {
            return Err(AgentError::InvalidArgument("empty speech frame".to_string()));
        }
        self.outbound.queue(Frame::Binary(data), timeout).await
    }

    /// Queue a user text turn; text conversations only
    pub async fn send_text(&self, text: &str, timeout: Duration) -> Result<()> {
        self.require_kind(ConversationKind::Text, "send_text")?;
        if text.is_empty() {
            return Err(AgentError::InvalidArgument("empty text message".to_string()));
        }
        self.outbound
            .queue(Frame::Text(encode_text_message(text)), timeout)
            .await
    }

    /// Mark the start of a user utterance
    pub async fn speech_conversation_start(&self) -> Result<()> {
        self.send_speech_marker(SpeechMarker::Start).await
    }

    /// Mark the end of a user utterance
    pub async fn speech_conversation_end(&self) -> Result<()> {
        self.send_speech_marker(SpeechMarker::End).await
    }

    async fn send_speech_marker(&self, marker: SpeechMarker) -> Result<()> {
        self.require_kind(ConversationKind::Speech, "speech markers")?;
        if self.state.handshake_state() != HandshakeState::Done {
            return Err(AgentError::InvalidState(
                "handshake has not completed".to_string(),
            ));
        }
        self.outbound
            .queue(
                Frame::Text(encode_speech_marker(marker)),
                self.config.queues.marker_timeout(),
            )
            .await
    }

    fn require_kind(&self, expected: ConversationKind, operation: &str) -> Result<()> {
        let kind = self.state.kind();
        if kind != expected {
            return Err(AgentError::InvalidState(format!(
                "{operation} is not available in a {kind} conversation"
            )));
        }
        Ok(())
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.get_mut().take() {
            let _ = runner.shutdown_tx.send(());
        }
    }
}

/// Everything one connection attempt needs, moved into its task
struct Link {
    ctx: DispatchContext,
    state: Arc<SessionState>,
    dispatcher: Arc<Dispatcher>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
    connector: Arc<dyn Connector>,
    token_provider: Arc<dyn TokenProvider>,
    url: String,
    refresh_token: String,
    handshake: String,
}

impl Link {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let setup = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => None,
            result = self.open() => Some(result),
        };

        match setup {
            None => debug!("Connection attempt cancelled"),
            Some(Err(e)) => error!("Failed to connect to agent: {}", e),
            Some(Ok(connection)) => self.serve(connection, shutdown_rx).await,
        }

        self.state.set_connection_state(ConnectionState::Disconnected);
        info!("Agent disconnected");
        if let Err(e) = self.ctx.events().post(AgentEvent::Disconnected).await {
            warn!("Disconnected event not delivered: {}", e);
        }
    }

    /// Authenticate, connect and write the handshake as the first frame
    async fn open(&self) -> Result<Connection> {
        self.state
            .set_connection_state(ConnectionState::Authenticating);
        let access_token = self
            .token_provider
            .access_token(&self.refresh_token)
            .await?;

        let mut connection = self.connector.connect(&self.url, &access_token).await?;
        info!("Connected to {}", self.url);
        if let Err(e) = self.ctx.events().post(AgentEvent::Connected).await {
            warn!("Connected event not delivered: {}", e);
        }

        connection
            .sink
            .send(Frame::Text(self.handshake.clone()))
            .await?;
        self.state
            .set_connection_state(ConnectionState::HandshakePending);
        debug!("Handshake sent");
        Ok(connection)
    }

    async fn serve(&self, connection: Connection, shutdown_rx: broadcast::Receiver<()>) {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        let mut writer_shutdown = shutdown_rx.resubscribe();
        let outbound_rx = Arc::clone(&self.outbound_rx);
        let mut writer = tokio::spawn(async move {
            let mut rx = outbound_rx.lock().await;
            loop {
                tokio::select! {
                    _ = writer_shutdown.recv() => break,
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            error!("Failed to write frame: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let mut reader_shutdown = shutdown_rx;
        let dispatcher = Arc::clone(&self.dispatcher);
        let ctx = self.ctx.clone();
        let mut reader = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = reader_shutdown.recv() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(Frame::Text(text))) => {
                        if let Err(e) = dispatcher.process(&ctx, &text).await {
                            warn!("Failed to handle message: {}", e);
                        }
                    }
                    Some(Ok(Frame::Binary(data))) => {
                        // post failures are logged by the bus
                        let _ = ctx.events().post(AgentEvent::Speech { data }).await;
                    }
                    Some(Err(e)) => {
                        error!("Read error: {}", e);
                        break;
                    }
                    None => {
                        info!("Server closed the connection");
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = &mut writer => {
                reader.abort();
                let _ = reader.await;
            }
            _ = &mut reader => {
                writer.abort();
                let _ = writer.await;
            }
        }
    }
}
