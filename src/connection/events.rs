use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Closed set of event kinds a connection can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Open,
    Message,
    Close,
    Error,
    Reconnecting,
    Reconnect,
}

/// Events broadcast by a [`Connection`](super::Connection) to its subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport signalled open
    Open,
    /// Inbound text frame, undecoded
    Message(String),
    /// Transport closed; `deliberate` distinguishes caller-initiated closes
    Close {
        code: Option<u16>,
        reason: String,
        deliberate: bool,
    },
    /// Transport or write error, already converted to a display string
    Error(String),
    /// A reconnect attempt was scheduled; fired before its backoff delay
    Reconnecting { attempt: u32 },
    /// A reconnect attempt re-opened the transport
    Reconnect,
}

impl ConnectionEvent {
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Open => ConnectionEventKind::Open,
            Self::Message(_) => ConnectionEventKind::Message,
            Self::Close { .. } => ConnectionEventKind::Close,
            Self::Error(_) => ConnectionEventKind::Error,
            Self::Reconnecting { .. } => ConnectionEventKind::Reconnecting,
            Self::Reconnect => ConnectionEventKind::Reconnect,
        }
    }
}

/// Identifies one subscription for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: u64,
    // None = wildcard, receives every event kind
    kind: Option<ConnectionEventKind>,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Typed publish/subscribe fan-out for connection events.
///
/// Each subscription gets its own unbounded channel; a subscriber that went
/// away (dropped its receiver) is pruned during the next emit and never
/// interferes with delivery to the others. The subscriber list is copied
/// out of the lock before dispatch, so a callback that subscribes or
/// unsubscribes mid-delivery cannot corrupt iteration.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event kind.
    pub fn on(
        &self,
        kind: ConnectionEventKind,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ConnectionEvent>) {
        self.register(Some(kind))
    }

    /// Subscribe to every event kind (diagnostics / session wiring).
    pub fn on_any(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<ConnectionEvent>) {
        self.register(None)
    }

    /// Remove one subscription; unknown ids are ignored.
    pub fn off(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| s.id != id.0);
    }

    /// Broadcast an event to every matching live subscriber.
    pub fn emit(&self, event: ConnectionEvent) {
        let kind = event.kind();
        let targets: Vec<(u64, mpsc::UnboundedSender<ConnectionEvent>)> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter()
                .filter(|s| s.kind.is_none() || s.kind == Some(kind))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).is_err() {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers.retain(|s| !dead.contains(&s.id));
            tracing::debug!("Pruned {} dead event subscriber(s)", dead.len());
        }
    }

    fn register(
        &self,
        kind: Option<ConnectionEventKind>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber { id, kind, tx });
        (SubscriptionId(id), rx)
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
