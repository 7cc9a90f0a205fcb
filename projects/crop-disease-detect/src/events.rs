use serde_json::{json, Value};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Event pushed to every connected subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Phase announcement.
    Message(String),
    /// Transcode percent-complete.
    Progress(f64),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Message(_) => "message",
            PushEvent::Progress(_) => "progress",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            PushEvent::Message(text) => json!({ "data": text }),
            PushEvent::Progress(percent) => json!({ "data": percent }),
        }
    }
}

/// Fan-out hub for push events. Sending never blocks, and events sent while
/// nobody listens are dropped.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<PushEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn message(&self, text: impl Into<String>) {
        self.send(PushEvent::Message(text.into()));
    }

    pub fn progress(&self, percent: f64) {
        self.send(PushEvent::Progress(percent));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: PushEvent) {
        tracing::debug!("push {} {}", event.name(), event.payload());
        // Err only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}
