use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::time::{self, MissedTickBehavior};

use super::queue::OutboundQueue;
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions};
use crate::health::{HealthMonitor, HealthStatus, MonitorProfile};
use crate::infrastructure::TaskManager;
use crate::types::constants::{
    CLIENT_VERSION, DEFAULT_DRAIN_RETRY_INTERVAL, DEFAULT_REQUEST_TIMEOUT,
};
use crate::types::message::epoch_ms;
use crate::types::{Result, SessionError, SessionMessage, WireFrame};

/// Wildcard key for subscribers that want every envelope type.
const WILDCARD: &str = "*";

/// Session-level configuration, injected at construction.
#[derive(Debug, Clone)]
pub struct SessionClientOptions {
    /// Identifier reported to the server in the handshake
    pub client_id: String,
    /// Protocol/client version reported in the handshake
    pub version: String,
    /// Tab this session belongs to; stamped onto outbound envelopes
    pub tab_id: Option<u64>,
    pub connection: ConnectionOptions,
    pub profile: MonitorProfile,
    /// Default deadline for [`SessionClient::send_and_wait`]
    pub request_timeout: Duration,
    /// Interval of the secondary queue-drain retry timer
    pub drain_retry_interval: Duration,
}

impl Default for SessionClientOptions {
    fn default() -> Self {
        Self {
            client_id: "debug-session".to_string(),
            version: CLIENT_VERSION.to_string(),
            tab_id: None,
            connection: ConnectionOptions::default(),
            profile: MonitorProfile::default(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT),
            drain_retry_interval: Duration::from_millis(DEFAULT_DRAIN_RETRY_INTERVAL),
        }
    }
}

/// Lifecycle notifications rebroadcast by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
    Reconnected,
    Error(String),
    /// Every decoded inbound envelope, for diagnostics
    Message(SessionMessage),
}

/// The logical session consumed by callers: typed envelopes, correlation-id
/// request/response, an outbound queue for disconnected periods, and a
/// handshake on every (re)connect.
///
/// The session outlives any single socket. While the transport is down,
/// [`send`](Self::send) buffers instead of failing; once the connection
/// (re)opens the handshake is sent first and the queue drains in FIFO
/// order.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    options: SessionClientOptions,
    monitor: HealthMonitor,
    connection: RwLock<Option<Connection>>,
    queue: OutboundQueue,
    pending: StdMutex<HashMap<String, oneshot::Sender<SessionMessage>>>,
    handlers: StdMutex<HashMap<String, Vec<mpsc::UnboundedSender<SessionMessage>>>>,
    events: broadcast::Sender<SessionEvent>,
    ref_counter: AtomicU64,
    /// Handshake acknowledged by a write since the last open
    attached: AtomicBool,
    /// Serializes handshake attempts from connect() and the event loop
    attach_lock: Mutex<()>,
    /// Serializes the pop/send/restore sequence across both drain paths
    drain_lock: Mutex<()>,
    tasks: StdMutex<TaskManager>,
    weak_self: Weak<SessionInner>,
}

impl SessionClient {
    pub fn new(options: SessionClientOptions) -> Self {
        let monitor = HealthMonitor::new(options.profile.clone());
        let (events, _) = broadcast::channel(128);
        let inner = Arc::new_cyclic(|weak_self| SessionInner {
            options,
            monitor,
            connection: RwLock::new(None),
            queue: OutboundQueue::new(),
            pending: StdMutex::new(HashMap::new()),
            handlers: StdMutex::new(HashMap::new()),
            events,
            ref_counter: AtomicU64::new(0),
            attached: AtomicBool::new(false),
            attach_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            tasks: StdMutex::new(TaskManager::new()),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Opens the session: dials the transport, wires health monitoring, and
    /// sends the handshake that attaches the logical session.
    ///
    /// # Errors
    ///
    /// Propagates connect failures from the underlying [`Connection`];
    /// auto-reconnect only engages after a connection was established once.
    pub async fn connect(&self, url: &str) -> Result<()> {
        let connection = Connection::new(url, self.inner.options.connection.clone());

        // Wire the event loop before dialing so the first Open is seen
        let (_sub, rx) = connection.on_any();
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.abort_all();
            tasks.spawn(SessionInner::event_loop(self.inner.weak_self.clone(), rx));
            tasks.spawn(SessionInner::drain_retry_loop(
                self.inner.weak_self.clone(),
                self.inner.options.drain_retry_interval,
            ));
        }

        self.inner
            .monitor
            .register_connection(self.inner.options.client_id.clone(), connection.clone())
            .await;
        let previous = self
            .inner
            .connection
            .write()
            .await
            .replace(connection.clone());
        if let Some(previous) = previous {
            tokio::spawn(async move {
                let _ = previous.disconnect().await;
            });
        }

        connection.connect().await?;
        self.inner.attach().await;
        Ok(())
    }

    /// Closes the session deliberately; queued messages stay queued and
    /// outstanding requests fail.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the close handshake fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.attached.store(false, Ordering::SeqCst);
        self.inner
            .monitor
            .unregister_connection(&self.inner.options.client_id)
            .await;
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();

        // Dropping the senders rejects every outstanding request
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        let connection = self.inner.connection.write().await.take();
        match connection {
            Some(connection) => connection.disconnect().await,
            None => Ok(()),
        }
    }

    /// Sends an envelope, stamping `meta.timestamp` and `meta.tabId` when
    /// absent. Returns `true` when it went out on the socket now; `false`
    /// when it was queued for the next drain. Messages are never dropped.
    pub async fn send(&self, mut message: SessionMessage) -> bool {
        self.inner.stamp(&mut message);
        self.inner.send_or_queue(message).await
    }

    /// Sends a request and waits for the reply correlated by message id.
    ///
    /// Exactly one path resolves: the matching reply, or a timeout after
    /// `timeout` (defaulting to the configured request timeout).
    ///
    /// # Errors
    ///
    /// [`SessionError::Timeout`] when no reply arrives in time, or
    /// [`SessionError::Connection`] when the session is torn down while the
    /// request is outstanding.
    pub async fn send_and_wait(
        &self,
        mut message: SessionMessage,
        timeout: Option<Duration>,
    ) -> Result<SessionMessage> {
        let id = self.inner.next_ref();
        message.meta.message_id = Some(id.clone());
        self.inner.stamp(&mut message);

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        self.inner.send_or_queue(message).await;

        let deadline = timeout.unwrap_or(self.inner.options.request_timeout);
        match time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::Connection(
                "session torn down while request was outstanding".to_string(),
            )),
            Err(_) => {
                self.inner
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(SessionError::Timeout)
            }
        }
    }

    /// Receive every inbound envelope of one `type`.
    pub fn subscribe(&self, msg_type: &str) -> mpsc::UnboundedReceiver<SessionMessage> {
        self.inner.add_handler(msg_type)
    }

    /// Receive every inbound envelope regardless of type.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<SessionMessage> {
        self.inner.add_handler(WILDCARD)
    }

    /// Lifecycle event stream (connect/disconnect/reconnect/error).
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.connection.read().await.as_ref() {
            Some(connection) => connection.is_connected().await,
            None => false,
        }
    }

    /// Health metrics for this session's connection; available even
    /// mid-failure so a UI can render a degrading state.
    pub async fn health(&self) -> Option<HealthStatus> {
        self.inner
            .monitor
            .status(&self.inner.options.client_id)
            .await
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.inner.monitor
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.queue.len()
    }

    /// The underlying connection, when the session has been connected.
    pub async fn connection(&self) -> Option<Connection> {
        self.inner.connection.read().await.clone()
    }
}

impl SessionInner {
    fn next_ref(&self) -> String {
        (self.ref_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, message: &mut SessionMessage) {
        if message.meta.timestamp.is_none() {
            message.meta.timestamp = Some(epoch_ms());
        }
        if message.meta.tab_id.is_none() {
            message.meta.tab_id = self.options.tab_id;
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn add_handler(&self, msg_type: &str) -> mpsc::UnboundedReceiver<SessionMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.entry(msg_type.to_string()).or_default().push(tx);
        rx
    }

    async fn current_connection(&self) -> Option<Connection> {
        self.connection.read().await.clone()
    }

    /// Write now when attached and open; otherwise buffer for the drain.
    async fn send_or_queue(&self, message: SessionMessage) -> bool {
        if self.attached.load(Ordering::SeqCst) {
            if let Some(connection) = self.current_connection().await {
                if matches!(connection.send_message(&message).await, Ok(true)) {
                    return true;
                }
            }
        }
        tracing::debug!("Queued '{}' for later delivery", message.msg_type);
        self.queue.enqueue(message);
        false
    }

    /// Handshake (once per physical connection) followed by a queue drain.
    /// The server treats each reconnect as a new logical attach, so the
    /// handshake must precede any queued message.
    async fn attach(&self) {
        let _guard = self.attach_lock.lock().await;

        if !self.attached.load(Ordering::SeqCst) {
            let Some(connection) = self.current_connection().await else {
                return;
            };
            let handshake = SessionMessage::handshake(
                &self.options.client_id,
                &self.options.version,
                self.options.tab_id,
            );
            match connection.send_message(&handshake).await {
                Ok(true) => {
                    self.attached.store(true, Ordering::SeqCst);
                    tracing::info!("Session handshake sent as '{}'", self.options.client_id);
                }
                _ => {
                    tracing::warn!("Handshake send failed, session not attached");
                    return;
                }
            }
        }

        self.drain().await;
    }

    /// FIFO drain; a failed send puts the message back at the head and
    /// stops. Draining an empty queue is a no-op, so the open-event path
    /// and the retry timer can both call this safely. Only one drain runs
    /// at a time: a restore racing another drain's pop would reorder the
    /// queue.
    async fn drain(&self) {
        let _guard = self.drain_lock.lock().await;

        if !self.attached.load(Ordering::SeqCst) {
            return;
        }
        let Some(connection) = self.current_connection().await else {
            return;
        };

        let mut sent = 0usize;
        loop {
            let Some(message) = self.queue.pop() else {
                break;
            };
            if !matches!(connection.send_message(&message).await, Ok(true)) {
                self.queue.restore(message);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            tracing::info!("Drained {} queued message(s)", sent);
        }
    }

    async fn event_loop(
        weak: Weak<SessionInner>,
        mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            match event {
                ConnectionEvent::Open => {
                    inner.attach().await;
                    inner.emit(SessionEvent::Connected);
                }
                ConnectionEvent::Reconnect => inner.emit(SessionEvent::Reconnected),
                ConnectionEvent::Reconnecting { attempt } => {
                    inner.emit(SessionEvent::Reconnecting { attempt })
                }
                ConnectionEvent::Close { .. } => {
                    inner.attached.store(false, Ordering::SeqCst);
                    inner.emit(SessionEvent::Disconnected);
                }
                ConnectionEvent::Error(e) => inner.emit(SessionEvent::Error(e)),
                ConnectionEvent::Message(text) => inner.handle_frame(&text).await,
            }
        }
    }

    /// Secondary drain path covering races where an open event and the
    /// drain it triggers miss each other.
    async fn drain_retry_loop(weak: Weak<SessionInner>, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if !inner.queue.is_empty() {
                inner.drain().await;
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match WireFrame::decode(text) {
            Err(e) => {
                // Malformed frames are logged and dropped, never fatal
                tracing::warn!("Dropping inbound frame: {}", e);
            }
            Ok(WireFrame::Ping(time)) => {
                if let Some(connection) = self.current_connection().await {
                    connection.send_text(WireFrame::encode_pong(time)).await;
                }
            }
            Ok(WireFrame::Pong(_)) => {
                // Heartbeat bookkeeping lives in the health monitor
            }
            Ok(WireFrame::Envelope(message)) => {
                if let Some(reply_to) = message.meta.response_to_id.clone() {
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&reply_to);
                    if let Some(tx) = waiter {
                        let _ = tx.send(message);
                        return;
                    }
                    tracing::debug!("Reply to unknown or expired request '{}'", reply_to);
                }
                self.dispatch(message);
            }
        }
    }

    fn dispatch(&self, message: SessionMessage) {
        self.emit(SessionEvent::Message(message.clone()));

        let targets: Vec<mpsc::UnboundedSender<SessionMessage>> = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&message.msg_type)
                .into_iter()
                .chain(handlers.get(WILDCARD))
                .flatten()
                .cloned()
                .collect()
        };

        let mut any_dead = false;
        for tx in targets {
            if tx.send(message.clone()).is_err() {
                any_dead = true;
            }
        }
        if any_dead {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            for senders in handlers.values_mut() {
                senders.retain(|tx| !tx.is_closed());
            }
            handlers.retain(|_, senders| !senders.is_empty());
        }
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("client_id", &self.inner.options.client_id)
            .field("queued", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}
