//! Event Delivery
//!
//! Typed events published by the session and a subscriber registry.
//!
//! Posting hands the event (and ownership of its payload) to a bounded queue
//! together with the handler chain installed at that moment. A single delivery
//! task pops events in order, runs every matching handler of that chain
//! synchronously in registration order, and drops the event once the last
//! handler has returned. Handlers only ever see `&AgentEvent`; anything they
//! want to keep they have to clone.

use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{AgentError, Result};

/// Discriminant of [`AgentEvent`], used to filter subscriptions
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    Deinit,
    Start,
    Stop,
    Error,
    Connected,
    Disconnected,
    SpeechStart,
    SpeechEnd,
    Text,
    Thinking,
    Speech,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Init => "init",
            EventKind::Deinit => "deinit",
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Error => "error",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::SpeechStart => "speech_start",
            EventKind::SpeechEnd => "speech_end",
            EventKind::Text => "text",
            EventKind::Thinking => "thinking",
            EventKind::Speech => "speech",
        };
        f.write_str(name)
    }
}

/// Who produced a transcript fragment
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Whether an assistant fragment is provisional or final
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStage {
    Speculative,
    Final,
    Unknown,
}

impl GenerationStage {
    /// Map `metadata.generation_stage`; absent or unrecognized values are `Unknown`
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("speculative") => GenerationStage::Speculative,
            Some("final") => GenerationStage::Final,
            _ => GenerationStage::Unknown,
        }
    }
}

/// Server-side error conditions the application is expected to act on
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorKind {
    /// The server gave up on the audio conversation; the session should be stopped
    AudioConversation,
}

impl ServerErrorKind {
    /// Map the `code` field of an error message. Unknown codes yield `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "AUDIO_CONVERSATION_ERROR" => Some(ServerErrorKind::AudioConversation),
            _ => None,
        }
    }
}

/// An event delivered to registered handlers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Init,
    Deinit,
    /// Handshake acknowledged
    Start {
        conversation_id: Option<String>,
    },
    Stop,
    Error {
        error: ServerErrorKind,
    },
    Connected,
    Disconnected,
    SpeechStart,
    SpeechEnd,
    Text {
        text: String,
        role: MessageRole,
        generation_stage: GenerationStage,
    },
    Thinking {
        thought: String,
    },
    /// Raw audio received from the server
    Speech {
        #[serde(rename = "len", serialize_with = "serialize_len")]
        data: Bytes,
    },
}

fn serialize_len<S: Serializer>(data: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(data.len() as u64)
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::Init => EventKind::Init,
            AgentEvent::Deinit => EventKind::Deinit,
            AgentEvent::Start { .. } => EventKind::Start,
            AgentEvent::Stop => EventKind::Stop,
            AgentEvent::Error { .. } => EventKind::Error,
            AgentEvent::Connected => EventKind::Connected,
            AgentEvent::Disconnected => EventKind::Disconnected,
            AgentEvent::SpeechStart => EventKind::SpeechStart,
            AgentEvent::SpeechEnd => EventKind::SpeechEnd,
            AgentEvent::Text { .. } => EventKind::Text,
            AgentEvent::Thinking { .. } => EventKind::Thinking,
            AgentEvent::Speech { .. } => EventKind::Speech,
        }
    }
}

/// Which events a handler receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Any,
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Kind(k) => *k == kind,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::Kind(kind)
    }
}

/// Receives events on the delivery task
///
/// Handlers run synchronously and should return quickly; long work belongs
/// on a task of the application's own.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AgentEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&AgentEvent) + Send + Sync,
{
    fn on_event(&self, event: &AgentEvent) {
        self(event)
    }
}

/// Identifies a registration so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

/// Handler chain; replaced as a whole on every change so a post can keep the
/// chain it saw
type Chain = Arc<Vec<Registration>>;

/// An event on its way to the delivery task
struct Posted {
    event: AgentEvent,
    chain: Chain,
}

/// Posting side of the event queue plus the handler registry
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Posted>,
    registry: Arc<RwLock<Chain>>,
    next_id: Arc<AtomicU64>,
    post_timeout: Duration,
}

/// Receiving side; turns into a running task with [`EventLoop::spawn`]
pub struct EventLoop {
    rx: mpsc::Receiver<Posted>,
}

/// Handle to the running delivery task
pub struct EventLoopHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl EventBus {
    /// Create a bus with a bounded queue of `capacity` events
    pub fn new(capacity: usize, post_timeout: Duration) -> (Self, EventLoop) {
        let (tx, rx) = mpsc::channel(capacity);
        let bus = Self {
            tx,
            registry: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            next_id: Arc::new(AtomicU64::new(1)),
            post_timeout,
        };
        (bus, EventLoop { rx })
    }

    /// Register a handler; it sees events posted after this call returns,
    /// and none posted before
    pub async fn register<H>(&self, filter: impl Into<EventFilter>, handler: H) -> HandlerId
    where
        H: EventHandler + 'static,
    {
        self.register_shared(filter.into(), Arc::new(handler)).await
    }

    /// Register a handler that is also held elsewhere
    pub async fn register_shared(
        &self,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut chain = self.registry.write().await;
        let mut next = Vec::clone(&chain);
        next.push(Registration {
            id,
            filter,
            handler,
        });
        *chain = Arc::new(next);
        debug!(?id, ?filter, "Registered event handler");
        id
    }

    /// Remove a handler; events posted before this call still reach it
    pub async fn unregister(&self, id: HandlerId) -> Result<()> {
        let mut chain = self.registry.write().await;
        if !chain.iter().any(|r| r.id == id) {
            return Err(AgentError::NotFound(format!("event handler {id:?}")));
        }
        let next: Vec<Registration> = chain.iter().filter(|r| r.id != id).cloned().collect();
        *chain = Arc::new(next);
        Ok(())
    }

    /// Number of handlers in the current chain
    pub async fn handler_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Queue an event for delivery, waiting at most the configured post timeout
    ///
    /// On failure the event, and the payload it owns, is dropped here.
    pub async fn post(&self, event: AgentEvent) -> Result<()> {
        let kind = event.kind();
        let chain = Arc::clone(&*self.registry.read().await);
        match self.tx.send_timeout(Posted { event, chain }, self.post_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                error!(%kind, "Failed to post event: delivery queue full");
                Err(AgentError::Timeout(format!("posting {kind} event")))
            }
            Err(SendTimeoutError::Closed(_)) => {
                error!(%kind, "Failed to post event: delivery stopped");
                Err(AgentError::Resource("event delivery has stopped".to_string()))
            }
        }
    }
}

impl EventLoop {
    pub fn spawn(self) -> EventLoopHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_delivery(self.rx, shutdown_rx));
        EventLoopHandle {
            shutdown_tx,
            handle,
        }
    }
}

impl EventLoopHandle {
    /// Deliver whatever is still queued, then stop the delivery task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!("Event delivery task failed: {}", e);
        }
    }
}

async fn run_delivery(
    mut rx: mpsc::Receiver<Posted>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            posted = rx.recv() => match posted {
                Some(posted) => deliver(posted),
                None => break,
            },
            _ = shutdown_rx.recv() => {
                while let Ok(posted) = rx.try_recv() {
                    deliver(posted);
                }
                break;
            }
        }
    }
    debug!("Event delivery stopped");
}

fn deliver(posted: Posted) {
    let Posted { event, chain } = posted;
    let kind = event.kind();

    for handler in chain
        .iter()
        .filter(|r| r.filter.matches(kind))
        .map(|r| &r.handler)
    {
        if catch_unwind(AssertUnwindSafe(|| handler.on_event(&event))).is_err() {
            error!(%kind, "Event handler panicked");
        }
    }

    // Every handler has returned; the payload goes with the event.
    drop(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn text_event(text: &str) -> AgentEvent {
        AgentEvent::Text {
            text: text.to_string(),
            role: MessageRole::Assistant,
            generation_stage: GenerationStage::Final,
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let (bus, event_loop) = EventBus::new(8, Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.register(EventFilter::Any, move |event: &AgentEvent| {
                seen.lock().unwrap().push(format!("{tag}:{}", event.kind()));
            })
            .await;
        }

        let handle = event_loop.spawn();
        bus.post(AgentEvent::Connected).await.unwrap();
        bus.post(text_event("hi")).await.unwrap();
        handle.shutdown().await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "first:connected",
                "second:connected",
                "third:connected",
                "first:text",
                "second:text",
                "third:text",
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_by_kind() {
        let (bus, event_loop) = EventBus::new(8, Duration::from_secs(1));
        let texts = Arc::new(Mutex::new(Vec::new()));
        let texts_clone = Arc::clone(&texts);
        bus.register(EventKind::Text, move |event: &AgentEvent| {
            if let AgentEvent::Text { text, .. } = event {
                texts_clone.lock().unwrap().push(text.clone());
            }
        })
        .await;

        let handle = event_loop.spawn();
        bus.post(AgentEvent::SpeechStart).await.unwrap();
        bus.post(text_event("hello")).await.unwrap();
        bus.post(AgentEvent::SpeechEnd).await.unwrap();
        handle.shutdown().await;

        assert_eq!(*texts.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (bus, _event_loop) = EventBus::new(8, Duration::from_secs(1));
        let id = bus.register(EventFilter::Any, |_: &AgentEvent| {}).await;
        assert_eq!(bus.handler_count().await, 1);
        bus.unregister(id).await.unwrap();
        assert_eq!(bus.handler_count().await, 0);
        assert!(matches!(
            bus.unregister(id).await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_speech_payload_released_after_last_handler() {
        struct Tracked {
            data: Vec<u8>,
            drops: Arc<AtomicUsize>,
        }
        impl AsRef<[u8]> for Tracked {
            fn as_ref(&self) -> &[u8] {
                &self.data
            }
        }
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.drops.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let (bus, event_loop) = EventBus::new(8, Duration::from_secs(1));

        let observed = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let drops = Arc::clone(&drops);
            let observed = Arc::clone(&observed);
            bus.register(EventKind::Speech, move |event: &AgentEvent| {
                if let AgentEvent::Speech { data } = event {
                    // still alive while any handler runs
                    assert_eq!(drops.load(Ordering::SeqCst), 0);
                    observed.lock().unwrap().push(data.len());
                }
            })
            .await;
        }

        let data = Bytes::from_owner(Tracked {
            data: vec![7u8; 320],
            drops: Arc::clone(&drops),
        });
        let handle = event_loop.spawn();
        bus.post(AgentEvent::Speech { data }).await.unwrap();
        handle.shutdown().await;

        assert_eq!(*observed.lock().unwrap(), vec![320, 320, 320]);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_delivery() {
        let (bus, event_loop) = EventBus::new(8, Duration::from_secs(1));
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(EventFilter::Any, |_: &AgentEvent| panic!("boom"))
            .await;
        let count_clone = Arc::clone(&count);
        bus.register(EventFilter::Any, move |_: &AgentEvent| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        let handle = event_loop.spawn();
        bus.post(AgentEvent::Connected).await.unwrap();
        bus.post(AgentEvent::Disconnected).await.unwrap();
        handle.shutdown().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chain_is_fixed_at_post_time() {
        let (bus, event_loop) = EventBus::new(8, Duration::from_secs(1));
        let early = Arc::new(AtomicUsize::new(0));
        let early_clone = Arc::clone(&early);
        let early_id = bus
            .register(EventFilter::Any, move |_: &AgentEvent| {
                early_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        bus.post(AgentEvent::Connected).await.unwrap();

        let late = Arc::new(AtomicUsize::new(0));
        let late_clone = Arc::clone(&late);
        bus.register(EventFilter::Any, move |_: &AgentEvent| {
            late_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        bus.unregister(early_id).await.unwrap();

        let handle = event_loop.spawn();
        handle.shutdown().await;

        // posted before the late handler existed and before the early one left
        assert_eq!(late.load(Ordering::SeqCst), 0);
        assert_eq!(early.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_times_out_when_queue_full() {
        let (bus, _event_loop) = EventBus::new(1, Duration::from_millis(50));
        bus.post(AgentEvent::Connected).await.unwrap();
        let err = bus.post(text_event("dropped")).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_post_after_shutdown_fails() {
        let (bus, event_loop) = EventBus::new(4, Duration::from_millis(50));
        event_loop.spawn().shutdown().await;
        assert!(matches!(
            bus.post(AgentEvent::Stop).await,
            Err(AgentError::Resource(_))
        ));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(text_event("hey")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "text",
                "text": "hey",
                "role": "assistant",
                "generation_stage": "final"
            })
        );

        let speech = serde_json::to_value(AgentEvent::Speech {
            data: Bytes::from_static(&[1, 2, 3]),
        })
        .unwrap();
        assert_eq!(speech, serde_json::json!({"event": "speech", "len": 3}));
    }

    #[test]
    fn test_generation_stage_from_wire() {
        assert_eq!(
            GenerationStage::from_wire(Some("speculative")),
            GenerationStage::Speculative
        );
        assert_eq!(GenerationStage::from_wire(Some("final")), GenerationStage::Final);
        assert_eq!(GenerationStage::from_wire(Some("draft")), GenerationStage::Unknown);
        assert_eq!(GenerationStage::from_wire(None), GenerationStage::Unknown);
    }

    #[test]
    fn test_server_error_codes() {
        assert_eq!(
            ServerErrorKind::from_code("AUDIO_CONVERSATION_ERROR"),
            Some(ServerErrorKind::AudioConversation)
        );
        assert_eq!(ServerErrorKind::from_code("RATE_LIMITED"), None);
    }
}
