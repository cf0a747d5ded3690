use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::connection::{Connection, ConnectionState};
use crate::health::HealthMonitor;
use crate::types::constants::{DEFAULT_CLEANUP_THRESHOLD, DEFAULT_SWEEP_INTERVAL, RAW_PING};
use crate::types::message::epoch_ms;

/// Caller-supplied metadata bound to a registered connection.
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    /// Human-readable owner, e.g. the debugged page title
    pub label: Option<String>,
    /// Owning tab/session, when the debugger tracks one per tab
    pub tab_id: Option<u64>,
}

/// Registry tuning, injected at construction time.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub sweep_interval: Duration,
    /// Inactivity span after which an entry is evicted
    pub cleanup_threshold: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL),
            cleanup_threshold: Duration::from_millis(DEFAULT_CLEANUP_THRESHOLD),
        }
    }
}

/// Point-in-time view of one registered connection, for UI consumption.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub label: Option<String>,
    pub tab_id: Option<u64>,
    pub created_at: u64,
    pub last_activity: u64,
}

struct RegistryEntry {
    connection: Connection,
    meta: EntryMeta,
    created_at: u64,
    last_activity: u64,
}

/// Fleet-level supervision over many simultaneous logical connections,
/// e.g. one per debugged browser tab.
///
/// A periodic sweep pings healthy connections, re-dials dropped ones, and
/// evicts entries idle past the cleanup threshold. The sweep loop only
/// runs while the registry is non-empty.
///
/// Cheap to clone; clones share the same entry set.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    options: RegistryOptions,
    monitor: Option<HealthMonitor>,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        Self::build(options, None)
    }

    /// Registry that also drives the health monitor's zombie sweep.
    pub fn with_health_monitor(options: RegistryOptions, monitor: HealthMonitor) -> Self {
        Self::build(options, Some(monitor))
    }

    fn build(options: RegistryOptions, monitor: Option<HealthMonitor>) -> Self {
        let inner = Arc::new_cyclic(|weak_self| RegistryInner {
            options,
            monitor,
            entries: RwLock::new(HashMap::new()),
            sweep_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        Self { inner }
    }

    /// Stores a connection under `id`; re-registration replaces (and
    /// releases) the previous entry. The first entry starts the sweep loop.
    pub async fn register_connection(
        &self,
        id: impl Into<String>,
        connection: Connection,
        meta: EntryMeta,
    ) {
        let id = id.into();
        let now = epoch_ms();
        let entry = RegistryEntry {
            connection,
            meta,
            created_at: now,
            last_activity: now,
        };

        let replaced = {
            let mut entries = self.inner.entries.write().await;
            entries.insert(id.clone(), entry)
        };
        if let Some(old) = replaced {
            tracing::warn!("Replaced registry entry '{}'", id);
            tokio::spawn(async move {
                let _ = old.connection.disconnect().await;
            });
        } else {
            tracing::info!("Registered connection '{}'", id);
        }

        self.inner.start_sweep();
    }

    /// Releases the connection's resources and removes the entry; the sweep
    /// loop stops once the registry is empty. Idempotent.
    pub async fn unregister_connection(&self, id: &str) {
        self.inner.unregister(id).await;
    }

    /// Moves the activity timestamp forward (never backward) for `id`.
    pub async fn touch(&self, id: &str) {
        let now = epoch_ms();
        let mut entries = self.inner.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.last_activity = entry.last_activity.max(now);
        }
    }

    /// One supervision pass, also run periodically by the sweep loop.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Snapshot map for UI consumption; never exposes live entries.
    pub async fn get_connection_statuses(&self) -> HashMap<String, ConnectionSnapshot> {
        let snapshot: Vec<(String, Connection, EntryMeta, u64, u64)> = {
            let entries = self.inner.entries.read().await;
            entries
                .iter()
                .map(|(id, e)| {
                    (
                        id.clone(),
                        e.connection.clone(),
                        e.meta.clone(),
                        e.created_at,
                        e.last_activity,
                    )
                })
                .collect()
        };

        let mut statuses = HashMap::with_capacity(snapshot.len());
        for (id, connection, meta, created_at, last_activity) in snapshot {
            statuses.insert(
                id,
                ConnectionSnapshot {
                    state: connection.state().await,
                    reconnect_attempts: connection.reconnect_attempts(),
                    label: meta.label,
                    tab_id: meta.tab_id,
                    created_at,
                    last_activity,
                },
            );
        }
        statuses
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.read().await.is_empty()
    }

    #[cfg(test)]
    fn sweep_running(&self) -> bool {
        self.inner
            .sweep_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl RegistryInner {
    async fn unregister(&self, id: &str) {
        let removed = self.entries.write().await.remove(id);
        let Some(entry) = removed else {
            return;
        };
        tracing::info!("Unregistered connection '{}'", id);

        if let Some(monitor) = &self.monitor {
            monitor.unregister_connection(id).await;
        }
        tokio::spawn(async move {
            let _ = entry.connection.disconnect().await;
        });

        if self.entries.read().await.is_empty() {
            self.stop_sweep();
        }
    }

    /// Sweep over a snapshot so event callbacks mutating the registry
    /// mid-pass cannot invalidate the iteration; removals apply at the end.
    async fn sweep(&self) {
        let now = epoch_ms();
        let threshold = self.options.cleanup_threshold.as_millis() as u64;

        let snapshot: Vec<(String, Connection, u64)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(id, e)| (id.clone(), e.connection.clone(), e.last_activity))
                .collect()
        };

        let mut stale = Vec::new();
        for (id, connection, last_activity) in snapshot {
            if now.saturating_sub(last_activity) > threshold {
                stale.push(id);
                continue;
            }
            match connection.state().await {
                ConnectionState::Open => {
                    connection.send_text(RAW_PING).await;
                }
                ConnectionState::Connecting => {}
                _ => {
                    tracing::info!("Sweep re-dialing dropped connection '{}'", id);
                    tokio::spawn(async move {
                        if let Err(e) = connection.connect().await {
                            tracing::warn!("Sweep reconnect for '{}' failed: {}", id, e);
                        }
                    });
                }
            }
        }

        if let Some(monitor) = &self.monitor {
            monitor.check_zombie_connections().await;
        }

        for id in stale {
            tracing::warn!("Evicting idle connection '{}'", id);
            self.unregister(&id).await;
        }
    }

    fn start_sweep(&self) {
        let mut slot = self.sweep_task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let weak = self.weak_self.clone();
        let interval = self.options.sweep_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the immediate tick; the first real pass comes one
            // interval after the registry became non-empty
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep().await;
            }
        }));
        tracing::debug!("Registry sweep loop started");
    }

    fn stop_sweep(&self) {
        let mut slot = self.sweep_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            tracing::debug!("Registry sweep loop stopped");
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}
