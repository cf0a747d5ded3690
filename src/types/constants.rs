/// Wire event type strings (magic strings layer)
pub mod wire_events {
    pub const HANDSHAKE: &str = "handshake";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// Lightweight heartbeat frames (non-JSON form)
pub const RAW_PING: &str = "ping";
pub const RAW_PONG: &str = "pong";

/// Client protocol version reported in the handshake
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default transport connect timeout (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 15_000;

/// Default base interval between reconnect attempts (milliseconds)
pub const DEFAULT_RECONNECT_INTERVAL: u64 = 1_000;

/// Ceiling for backoff delays (milliseconds)
pub const MAX_RECONNECT_DELAY: u64 = 30_000;

/// Growth factor for successive reconnect delays
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Default cap on automatic reconnect attempts
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default heartbeat ping interval (milliseconds)
pub const DEFAULT_PING_INTERVAL: u64 = 30_000;

/// Default wait for a pong before counting a miss (milliseconds)
pub const DEFAULT_PONG_TIMEOUT: u64 = 5_000;

/// Consecutive missed pongs before a connection is declared a zombie
pub const DEFAULT_ZOMBIE_THRESHOLD: u32 = 3;

/// Default cap on heartbeat-driven reconnects
pub const DEFAULT_MAX_HEALTH_RECONNECTS: u32 = 5;

/// Default delay before a heartbeat-driven reconnect (milliseconds)
pub const DEFAULT_HEALTH_RECONNECT_DELAY: u64 = 2_000;

/// Default size of the rolling latency sample window
pub const DEFAULT_LATENCY_WINDOW: usize = 10;

/// Default interval of the registry supervision sweep (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL: u64 = 30_000;

/// Default inactivity threshold before an entry is evicted (milliseconds)
pub const DEFAULT_CLEANUP_THRESHOLD: u64 = 300_000;

/// Default interval of the secondary queue-drain retry timer (milliseconds)
pub const DEFAULT_DRAIN_RETRY_INTERVAL: u64 = 5_000;

/// Default deadline for a correlated request (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10_000;
