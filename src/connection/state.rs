use crate::types::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
};

/// Lifecycle states of one transport-attempt lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// The single transition predicate of the connection state machine.
    ///
    /// Every state change goes through this check, so an illegal edge
    /// (e.g. `Closed -> Open` without a connect in between) cannot happen.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
                | (Closed, Connecting)
        )
    }

    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Per-connection tuning, injected at construction time.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect automatically on non-deliberate closes
    pub auto_reconnect: bool,
    /// Base delay between reconnect attempts (milliseconds)
    pub reconnect_interval: u64,
    /// Attempts before the connection gives up and stays closed
    pub max_reconnect_attempts: u32,
    /// Transport connect deadline (milliseconds)
    pub connect_timeout: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
