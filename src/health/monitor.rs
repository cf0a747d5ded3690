use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::status::HealthStatus;
use crate::connection::{Connection, ConnectionEvent, ConnectionEventKind};
use crate::infrastructure::TaskManager;
use crate::types::constants::{
    DEFAULT_HEALTH_RECONNECT_DELAY, DEFAULT_LATENCY_WINDOW, DEFAULT_MAX_HEALTH_RECONNECTS,
    DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT, DEFAULT_ZOMBIE_THRESHOLD,
};
use crate::types::message::epoch_ms;
use crate::types::WireFrame;

/// Heartbeat tuning, injected at construction.
///
/// Some deployment environments throttle background timers aggressively;
/// callers pick a profile instead of the monitor sniffing its environment.
#[derive(Debug, Clone)]
pub struct MonitorProfile {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Consecutive missed pongs before a connection is declared a zombie
    pub zombie_threshold: u32,
    pub reconnect_delay: Duration,
    /// Heartbeat-driven reconnects allowed before giving up
    pub max_reconnects: u32,
    pub latency_window: usize,
}

impl Default for MonitorProfile {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL),
            pong_timeout: Duration::from_millis(DEFAULT_PONG_TIMEOUT),
            zombie_threshold: DEFAULT_ZOMBIE_THRESHOLD,
            reconnect_delay: Duration::from_millis(DEFAULT_HEALTH_RECONNECT_DELAY),
            max_reconnects: DEFAULT_MAX_HEALTH_RECONNECTS,
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

impl MonitorProfile {
    /// Profile for hosts that throttle background timers: pings half as
    /// often and waits longer for each pong before counting a miss.
    pub fn throttled() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(10),
            ..Self::default()
        }
    }
}

/// Health transitions broadcast to whoever subscribes.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// The peer stopped answering heartbeats on a seemingly-open socket
    Zombie { id: String },
    /// A zombie connection answered a heartbeat again
    Recovered { id: String },
    /// Heartbeat-driven reconnects are exhausted for this connection
    MaxReconnects { id: String },
}

struct MonitoredConnection {
    connection: Connection,
    status: HealthStatus,
    /// Ping scheduler, pong listener, and in-flight reconnect tasks
    tasks: TaskManager,
    pong_timer: Option<JoinHandle<()>>,
}

impl Drop for MonitoredConnection {
    fn drop(&mut self) {
        if let Some(timer) = self.pong_timer.take() {
            timer.abort();
        }
        // self.tasks aborts its handles on drop
    }
}

/// Application-level heartbeat over already-open connections.
///
/// The transport cannot tell a half-dead socket from a healthy one; this
/// monitor can. It pings each registered connection on a schedule, tracks
/// latency and packet loss, declares zombies after consecutive missed
/// pongs, and forces a fresh socket when the peer has gone quiet.
///
/// Cheap to clone; clones share the same monitored set.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    profile: MonitorProfile,
    entries: RwLock<HashMap<String, MonitoredConnection>>,
    events: broadcast::Sender<HealthEvent>,
    weak_self: Weak<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(profile: MonitorProfile) -> Self {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new_cyclic(|weak_self| MonitorInner {
            profile,
            entries: RwLock::new(HashMap::new()),
            events,
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    pub fn profile(&self) -> &MonitorProfile {
        &self.inner.profile
    }

    /// Subscribe to zombie / recovered / max-reconnects notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }

    /// Starts heartbeat supervision for `connection` under `id`.
    ///
    /// Re-registering an id replaces the previous entry and tears its
    /// timers down first.
    pub async fn register_connection(&self, id: impl Into<String>, connection: Connection) {
        let id = id.into();
        let mut entry = MonitoredConnection {
            connection: connection.clone(),
            status: HealthStatus::new(self.inner.profile.latency_window),
            tasks: TaskManager::new(),
            pong_timer: None,
        };

        entry.tasks.spawn(Self::pong_listener(
            self.inner.weak_self.clone(),
            id.clone(),
            connection.clone(),
        ));
        entry.tasks.spawn(Self::ping_scheduler(
            self.inner.weak_self.clone(),
            id.clone(),
            self.inner.profile.ping_interval,
        ));

        let mut entries = self.inner.entries.write().await;
        if entries.insert(id.clone(), entry).is_some() {
            tracing::warn!("Replaced existing health entry for '{}'", id);
        } else {
            tracing::info!("Monitoring connection '{}' ({})", id, connection.url());
        }
    }

    /// Stops supervision and cancels every timer for `id`. Idempotent.
    pub async fn unregister_connection(&self, id: &str) {
        let removed = self.inner.entries.write().await.remove(id);
        if removed.is_some() {
            tracing::info!("Stopped monitoring connection '{}'", id);
        }
        // Entry drop aborts the scheduler, listener, and pong timer
    }

    /// Snapshot of one connection's metrics; never a live reference.
    pub async fn status(&self, id: &str) -> Option<HealthStatus> {
        self.inner
            .entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.status.clone())
    }

    /// Snapshot of every monitored connection's metrics.
    pub async fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.inner
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status.clone()))
            .collect()
    }

    /// On-demand zombie sweep, independent of the per-connection timers.
    ///
    /// Flags any connection whose last pong (or registration, if it never
    /// answered) is older than `ping_interval * zombie_threshold`. Covers
    /// the case where the process was suspended and no pong timeout fired.
    /// Returns the ids flagged by this sweep.
    pub async fn check_zombie_connections(&self) -> Vec<String> {
        let now = epoch_ms();
        let horizon = self.inner.profile.ping_interval.as_millis() as u64
            * self.inner.profile.zombie_threshold as u64;

        let flagged: Vec<(String, Connection)> = {
            let mut entries = self.inner.entries.write().await;
            let mut out = Vec::new();
            for (id, entry) in entries.iter_mut() {
                if entry.status.is_zombie {
                    continue;
                }
                let reference = entry
                    .status
                    .last_pong_time
                    .unwrap_or(entry.status.connection_start);
                if now.saturating_sub(reference) > horizon {
                    entry.status.is_zombie = true;
                    out.push((id.clone(), entry.connection.clone()));
                }
            }
            out
        };

        let mut ids = Vec::with_capacity(flagged.len());
        for (id, _connection) in flagged {
            tracing::warn!("Sweep flagged '{}' as zombie (no pong within horizon)", id);
            let _ = self.inner.events.send(HealthEvent::Zombie { id: id.clone() });
            self.inner.trigger_reconnect(&id).await;
            ids.push(id);
        }
        ids
    }

    async fn ping_scheduler(weak: Weak<MonitorInner>, id: String, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The immediate first tick would ping before the transport is up
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if !inner.send_ping(&id).await {
                break;
            }
        }
    }

    async fn pong_listener(weak: Weak<MonitorInner>, id: String, connection: Connection) {
        let (_sub, mut rx) = connection.on(ConnectionEventKind::Message);
        while let Some(event) = rx.recv().await {
            let ConnectionEvent::Message(text) = event else {
                continue;
            };
            if let Ok(WireFrame::Pong(time)) = WireFrame::decode(&text) {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_pong(&id, time).await;
            }
        }
    }
}

impl MonitorInner {
    /// One ping cycle. Returns `false` once the entry is gone so the
    /// scheduler can stop.
    async fn send_ping(&self, id: &str) -> bool {
        let connection = {
            let entries = self.entries.read().await;
            match entries.get(id) {
                Some(entry) => entry.connection.clone(),
                None => return false,
            }
        };

        if !connection.is_connected().await {
            return true;
        }

        let ping_time = epoch_ms();
        if !connection.send_text(WireFrame::encode_ping(ping_time)).await {
            return true;
        }
        tracing::debug!("Sent heartbeat ping to '{}' at {}", id, ping_time);

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        entry.status.last_ping_time = Some(ping_time);

        // Re-arm the pong timeout; at most one is outstanding per entry
        if let Some(previous) = entry.pong_timer.take() {
            previous.abort();
        }
        let weak = self.weak_self.clone();
        let timer_id = id.to_string();
        let pong_timeout = self.profile.pong_timeout;
        entry.pong_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(pong_timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.handle_missed_pong(&timer_id, ping_time).await;
            }
        }));
        true
    }

    async fn handle_pong(&self, id: &str, time: Option<u64>) {
        let now = epoch_ms();
        let was_zombie = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            if let Some(timer) = entry.pong_timer.take() {
                timer.abort();
            }
            let was_zombie = entry.status.is_zombie;
            // Correlate by the echoed timestamp, not arrival order
            let latency = time.map(|t| now.saturating_sub(t));
            entry.status.record_pong(latency, now);
            if let Some(latency) = latency {
                tracing::debug!("Pong from '{}': latency {}ms", id, latency);
            }
            was_zombie
        };

        if was_zombie {
            tracing::info!("Connection '{}' recovered from zombie state", id);
            let _ = self.events.send(HealthEvent::Recovered { id: id.to_string() });
        }
    }

    async fn handle_missed_pong(&self, id: &str, ping_time: u64) {
        let became_zombie = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            // A newer ping owns the timeout now; this one is stale
            if entry.status.last_ping_time != Some(ping_time) {
                return;
            }
            let missed = entry.status.record_missed_pong();
            tracing::warn!(
                "Missed pong {}/{} for '{}'",
                missed,
                self.profile.zombie_threshold,
                id
            );
            let became = !entry.status.is_zombie && missed >= self.profile.zombie_threshold;
            if became {
                entry.status.is_zombie = true;
            }
            became
        };

        if became_zombie {
            tracing::error!("Connection '{}' is a zombie, forcing reconnect", id);
            let _ = self.events.send(HealthEvent::Zombie { id: id.to_string() });
            self.trigger_reconnect(id).await;
        }
    }

    async fn trigger_reconnect(&self, id: &str) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };

        entry.status.reconnect_count += 1;
        if entry.status.reconnect_count > self.profile.max_reconnects {
            tracing::error!(
                "Connection '{}' exceeded {} health reconnects, giving up",
                id,
                self.profile.max_reconnects
            );
            let _ = self
                .events
                .send(HealthEvent::MaxReconnects { id: id.to_string() });
            return;
        }

        let connection = entry.connection.clone();
        let weak = self.weak_self.clone();
        let task_id = id.to_string();
        let delay = self.profile.reconnect_delay;
        // Tracked on the entry so unregistering cancels a pending reconnect
        entry.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            match connection.reconnect().await {
                Ok(()) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.clear_failure_state(&task_id).await;
                    }
                }
                Err(e) => {
                    tracing::warn!("Health reconnect for '{}' failed: {}", task_id, e);
                }
            }
        });
    }

    async fn clear_failure_state(&self, id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.status.reset_after_reconnect();
            tracing::info!("Connection '{}' reconnected, heartbeat state reset", id);
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("profile", &self.inner.profile)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;

    fn test_profile() -> MonitorProfile {
        MonitorProfile {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(20),
            zombie_threshold: 3,
            reconnect_delay: Duration::from_millis(10),
            max_reconnects: 2,
            latency_window: 5,
        }
    }

    fn idle_connection() -> Connection {
        // Never dialed; monitor logic under test does not need a socket
        Connection::new(
            "ws://127.0.0.1:1/",
            ConnectionOptions {
                auto_reconnect: false,
                ..Default::default()
            },
        )
    }

    async fn force_last_ping(monitor: &HealthMonitor, id: &str, ping_time: u64) {
        let mut entries = monitor.inner.entries.write().await;
        entries.get_mut(id).unwrap().status.last_ping_time = Some(ping_time);
    }

    #[tokio::test]
    async fn test_zombie_after_exactly_threshold_misses() {
        let monitor = HealthMonitor::new(test_profile());
        let mut events = monitor.subscribe();
        monitor.register_connection("tab-1", idle_connection()).await;

        for miss in 1..=3u64 {
            force_last_ping(&monitor, "tab-1", miss).await;
            monitor.inner.handle_missed_pong("tab-1", miss).await;
        }

        let status = monitor.status("tab-1").await.unwrap();
        assert!(status.is_zombie);
        assert_eq!(status.missed_pong_count, 3);
        assert!(matches!(events.try_recv(), Ok(HealthEvent::Zombie { .. })));
    }

    #[tokio::test]
    async fn test_two_misses_are_not_a_zombie() {
        let monitor = HealthMonitor::new(test_profile());
        monitor.register_connection("tab-1", idle_connection()).await;

        for miss in 1..=2u64 {
            force_last_ping(&monitor, "tab-1", miss).await;
            monitor.inner.handle_missed_pong("tab-1", miss).await;
        }

        assert!(!monitor.status("tab-1").await.unwrap().is_zombie);
    }

    #[tokio::test]
    async fn test_single_pong_recovers_a_zombie() {
        let monitor = HealthMonitor::new(test_profile());
        let mut events = monitor.subscribe();
        monitor.register_connection("tab-1", idle_connection()).await;

        for miss in 1..=3u64 {
            force_last_ping(&monitor, "tab-1", miss).await;
            monitor.inner.handle_missed_pong("tab-1", miss).await;
        }
        assert!(matches!(events.try_recv(), Ok(HealthEvent::Zombie { .. })));

        monitor.inner.handle_pong("tab-1", Some(epoch_ms())).await;

        let status = monitor.status("tab-1").await.unwrap();
        assert!(!status.is_zombie);
        assert_eq!(status.missed_pong_count, 0);
        assert!(matches!(events.try_recv(), Ok(HealthEvent::Recovered { .. })));
    }

    #[tokio::test]
    async fn test_stale_pong_timeout_is_ignored() {
        let monitor = HealthMonitor::new(test_profile());
        monitor.register_connection("tab-1", idle_connection()).await;

        force_last_ping(&monitor, "tab-1", 2000).await;
        // Timeout armed by an older ping must not count against the new one
        monitor.inner.handle_missed_pong("tab-1", 1000).await;

        assert_eq!(monitor.status("tab-1").await.unwrap().missed_pong_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_flags_silent_connection_once() {
        let monitor = HealthMonitor::new(test_profile());
        monitor.register_connection("tab-1", idle_connection()).await;
        monitor.register_connection("tab-2", idle_connection()).await;

        // tab-1 went silent well past the zombie horizon; tab-2 is fresh
        {
            let mut entries = monitor.inner.entries.write().await;
            let status = &mut entries.get_mut("tab-1").unwrap().status;
            status.last_pong_time = Some(epoch_ms().saturating_sub(10_000));
            entries.get_mut("tab-2").unwrap().status.last_pong_time = Some(epoch_ms());
        }

        let flagged = monitor.check_zombie_connections().await;
        assert_eq!(flagged, vec!["tab-1".to_string()]);

        // Already-flagged zombies are not reported again
        assert!(monitor.check_zombie_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_max_reconnects_emits_terminal_event() {
        let monitor = HealthMonitor::new(test_profile());
        let mut events = monitor.subscribe();
        monitor.register_connection("tab-1", idle_connection()).await;

        // max_reconnects = 2: third trigger is over budget
        monitor.inner.trigger_reconnect("tab-1").await;
        monitor.inner.trigger_reconnect("tab-1").await;
        monitor.inner.trigger_reconnect("tab-1").await;

        let status = monitor.status("tab-1").await.unwrap();
        assert_eq!(status.reconnect_count, 3);
        assert!(matches!(
            events.try_recv(),
            Ok(HealthEvent::MaxReconnects { .. })
        ));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let monitor = HealthMonitor::new(test_profile());
        monitor.register_connection("tab-1", idle_connection()).await;

        monitor.unregister_connection("tab-1").await;
        monitor.unregister_connection("tab-1").await;

        assert!(monitor.status("tab-1").await.is_none());
    }

    #[tokio::test]
    async fn test_status_is_a_defensive_copy() {
        let monitor = HealthMonitor::new(test_profile());
        monitor.register_connection("tab-1", idle_connection()).await;

        let mut copy = monitor.status("tab-1").await.unwrap();
        copy.missed_pong_count = 99;

        assert_eq!(monitor.status("tab-1").await.unwrap().missed_pong_count, 0);
    }
}
