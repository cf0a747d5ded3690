use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use super::events::{ConnectionEvent, ConnectionEventKind, EventBus, SubscriptionId};
use super::state::{ConnectionOptions, ConnectionState};
use crate::infrastructure::{Backoff, TaskManager};
use crate::types::{Result, SessionError, SessionMessage};
use crate::websocket::{WebSocketFactory, WsSink, WsStream};

/// One transport-attempt lineage to a single URL.
///
/// A `Connection` owns at most one live socket at a time: every connect
/// first releases the previous handle and its reader task, so listeners are
/// never wired twice. On a close the caller did not ask for, it re-dials
/// with capped exponential backoff until `max_reconnect_attempts` is
/// exhausted, after which it stays `Closed` until `connect()` is called
/// again.
///
/// The handle is cheap to clone; clones share the same socket and state.
#[derive(Clone)]
pub struct Connection {
    url: String,
    options: ConnectionOptions,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<RwLock<Option<WsSink>>>,
    events: Arc<EventBus>,
    reconnect_attempts: Arc<AtomicU32>,
    manual_close: Arc<AtomicBool>,
    reconnect_loop_active: Arc<AtomicBool>,
    // Reader task lives here; the reconnect loop is tracked separately so
    // tearing down the socket cannot abort the loop that drives it.
    io_tasks: Arc<Mutex<TaskManager>>,
    reconnect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Connection {
    pub fn new(url: impl Into<String>, options: ConnectionOptions) -> Self {
        Self {
            url: url.into(),
            options,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            writer: Arc::new(RwLock::new(None)),
            events: Arc::new(EventBus::new()),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            manual_close: Arc::new(AtomicBool::new(false)),
            reconnect_loop_active: Arc::new(AtomicBool::new(false)),
            io_tasks: Arc::new(Mutex::new(TaskManager::new())),
            reconnect_task: Arc::new(Mutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_open()
    }

    /// Reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Subscribe to one event kind.
    pub fn on(
        &self,
        kind: ConnectionEventKind,
    ) -> (
        SubscriptionId,
        tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        self.events.on(kind)
    }

    /// Subscribe to every event this connection emits.
    pub fn on_any(
        &self,
    ) -> (
        SubscriptionId,
        tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        self.events.on_any()
    }

    /// Drop a subscription made with [`on`](Self::on) or [`on_any`](Self::on_any).
    pub fn off(&self, id: SubscriptionId) {
        self.events.off(id);
    }

    /// Opens the transport, enforcing the configured connect timeout.
    ///
    /// Already being `Open` or `Connecting` is a no-op. A timeout fails with
    /// [`SessionError::Timeout`] and leaves the connection `Closed`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Timeout`] when the deadline elapses, or a
    /// transport/URL error when the dial itself fails. A failed initial
    /// connect is reported to the caller and not retried automatically.
    pub async fn connect(&self) -> Result<()> {
        {
            let state = self.state().await;
            if state == ConnectionState::Open || state == ConnectionState::Connecting {
                return Ok(());
            }
        }

        // Release any previous socket and its reader before dialing again
        self.teardown_socket().await;
        self.manual_close.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting).await;

        tracing::info!("Connecting to {}", self.url);
        let connect_timeout = Duration::from_millis(self.options.connect_timeout);
        let stream = match timeout(connect_timeout, WebSocketFactory::create(&self.url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!("Connect to {} failed: {}", self.url, e);
                self.set_state(ConnectionState::Closed).await;
                self.events.emit(ConnectionEvent::Error(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    "Connect to {} timed out after {:?}",
                    self.url,
                    connect_timeout
                );
                self.set_state(ConnectionState::Closed).await;
                self.events
                    .emit(ConnectionEvent::Error("connect timed out".to_string()));
                return Err(SessionError::Timeout);
            }
        };

        let (write_half, read_half) = stream.split();
        *self.writer.write().await = Some(write_half);
        // Open before the reader starts, so an instant server-side close
        // transitions Open -> Closed rather than racing the state machine
        self.set_state(ConnectionState::Open).await;
        self.spawn_read_task(read_half);

        // Counter resets strictly on successful open
        let was_retry = self.reconnect_attempts.swap(0, Ordering::SeqCst) > 0;
        tracing::info!("Connected to {}", self.url);
        self.events.emit(ConnectionEvent::Open);
        if was_retry {
            self.events.emit(ConnectionEvent::Reconnect);
        }
        Ok(())
    }

    /// Attempts a write, returning `false` without error when not `Open`.
    ///
    /// Returns `true` once a write was attempted; sink failures surface as
    /// `Error` events rather than through the return value. This layer never
    /// queues; buffering for disconnected periods belongs to the session.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        if !self.state().await.is_open() {
            return false;
        }
        let text: String = text.into();

        let mut guard = self.writer.write().await;
        let Some(ws) = guard.as_mut() else {
            return false;
        };
        if let Err(e) = ws.send(Message::Text(text.into())).await {
            drop(guard);
            tracing::warn!("WebSocket write to {} failed: {}", self.url, e);
            self.events
                .emit(ConnectionEvent::Error(format!("write failed: {}", e)));
        }
        true
    }

    /// Serializes and sends a session envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Serialization`] when the envelope cannot be
    /// encoded; transport-level outcomes follow [`send_text`](Self::send_text)
    /// semantics.
    pub async fn send_message(&self, message: &SessionMessage) -> Result<bool> {
        let json = serde_json::to_string(message)?;
        Ok(self.send_text(json).await)
    }

    /// Deliberately closes the connection and suppresses auto-reconnect.
    ///
    /// Resolves once the underlying close completes, or immediately when the
    /// connection is already closed.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the close handshake itself fails.
    pub async fn disconnect(&self) -> Result<()> {
        self.manual_close.store(true, Ordering::SeqCst);
        self.stop_reconnect_loop();

        {
            let state = self.state().await;
            if state == ConnectionState::Closed || state == ConnectionState::Idle {
                return Ok(());
            }
        }

        tracing::info!("Disconnecting from {}", self.url);
        self.set_state(ConnectionState::Closing).await;

        // Stop the reader first so the close is not reported twice
        self.io_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();

        let close_result = {
            let mut guard = self.writer.write().await;
            let result = match guard.as_mut() {
                Some(ws) => ws.close().await,
                None => Ok(()),
            };
            *guard = None;
            result
        };

        self.set_state(ConnectionState::Closed).await;
        self.events.emit(ConnectionEvent::Close {
            code: None,
            reason: "client disconnect".to_string(),
            deliberate: true,
        });

        close_result.map_err(SessionError::from)
    }

    /// Forces a fresh socket on this connection (used by health monitoring
    /// when the peer stops answering heartbeats on a seemingly-open socket).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`connect`](Self::connect).
    pub async fn reconnect(&self) -> Result<()> {
        tracing::info!("Replacing socket for {}", self.url);
        self.teardown_socket().await;
        {
            let mut guard = self.state.write().await;
            if matches!(
                *guard,
                ConnectionState::Open | ConnectionState::Connecting | ConnectionState::Closing
            ) {
                *guard = ConnectionState::Closed;
            }
        }
        self.connect().await
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut guard = self.state.write().await;
        if *guard == next {
            return;
        }
        if !guard.can_transition(next) {
            tracing::warn!("Rejected illegal state transition {} -> {}", *guard, next);
            return;
        }
        tracing::debug!("Connection {} state {} -> {}", self.url, *guard, next);
        *guard = next;
    }

    async fn teardown_socket(&self) {
        self.io_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
        let mut guard = self.writer.write().await;
        if guard.is_some() {
            tracing::debug!("Releasing previous socket handle for {}", self.url);
        }
        *guard = None;
    }

    fn spawn_read_task(&self, mut read_half: SplitStream<WsStream>) {
        let conn = self.clone();
        let mut tasks = self.io_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.spawn(async move {
            while let Some(frame) = read_half.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        tracing::debug!("Received text frame ({} bytes)", text.len());
                        conn.events
                            .emit(ConnectionEvent::Message(text.as_str().to_string()));
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                            None => (None, String::new()),
                        };
                        tracing::warn!(
                            "Server closed connection: code={:?}, reason='{}'",
                            code,
                            reason
                        );
                        conn.handle_transport_close(code, reason).await;
                        return;
                    }
                    Ok(Message::Ping(data)) => {
                        tracing::debug!("Received transport ping ({} bytes)", data.len());
                    }
                    Ok(Message::Pong(data)) => {
                        tracing::debug!("Received transport pong ({} bytes)", data.len());
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::warn!("Ignoring unexpected binary frame ({} bytes)", data.len());
                    }
                    Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        tracing::error!("WebSocket read error: {}", e);
                        conn.events.emit(ConnectionEvent::Error(e.to_string()));
                        conn.handle_transport_close(None, format!("read error: {}", e))
                            .await;
                        return;
                    }
                }
            }
            // Stream ended without a close frame
            conn.handle_transport_close(None, "stream ended".to_string())
                .await;
        });
    }

    async fn handle_transport_close(&self, code: Option<u16>, reason: String) {
        *self.writer.write().await = None;
        let deliberate = self.manual_close.load(Ordering::SeqCst);
        self.set_state(ConnectionState::Closed).await;
        self.events.emit(ConnectionEvent::Close {
            code,
            reason,
            deliberate,
        });

        if !deliberate && self.options.auto_reconnect {
            self.spawn_reconnect_loop();
        }
    }

    /// At most one reconnect loop may run per connection; the atomic guard
    /// makes scheduling two concurrent backoff timers impossible.
    fn spawn_reconnect_loop(&self) {
        if self.reconnect_loop_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let conn = self.clone();
        let handle = tokio::spawn(async move {
            let backoff = Backoff::new(conn.options.reconnect_interval);
            let mut reconnected = false;
            loop {
                let attempt = conn.reconnect_attempts.load(Ordering::SeqCst) + 1;
                if attempt > conn.options.max_reconnect_attempts {
                    tracing::warn!(
                        "Giving up on {} after {} reconnect attempts",
                        conn.url,
                        conn.options.max_reconnect_attempts
                    );
                    conn.events.emit(ConnectionEvent::Error(
                        SessionError::Capacity(conn.options.max_reconnect_attempts).to_string(),
                    ));
                    break;
                }

                conn.events.emit(ConnectionEvent::Reconnecting { attempt });
                tokio::time::sleep(backoff.delay_for(attempt)).await;

                if conn.manual_close.load(Ordering::SeqCst) {
                    break;
                }
                conn.reconnect_attempts.store(attempt, Ordering::SeqCst);

                match conn.connect().await {
                    Ok(()) => {
                        reconnected = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Reconnect attempt {} to {} failed: {}", attempt, conn.url, e)
                    }
                }
            }
            conn.finish_reconnect_loop(reconnected).await;
        });

        let mut slot = self.reconnect_task.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    /// Runs when the reconnect loop exits. A transport close that lands
    /// between a successful reconnect and the guard clearing below cannot
    /// schedule its own loop (the guard is still held), so re-check the
    /// state here and reschedule if that window was hit.
    async fn finish_reconnect_loop(&self, reconnected: bool) {
        self.reconnect_loop_active.store(false, Ordering::SeqCst);
        if reconnected
            && !self.manual_close.load(Ordering::SeqCst)
            && self.state().await == ConnectionState::Closed
        {
            tracing::debug!("Socket closed while reconnect loop was exiting, rescheduling");
            self.spawn_reconnect_loop();
        }
    }

    fn stop_reconnect_loop(&self) {
        let handle = {
            let mut slot = self.reconnect_task.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
        self.reconnect_loop_active.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}
