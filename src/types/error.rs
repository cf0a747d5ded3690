use thiserror::Error;

/// Errors surfaced by the debug-session wire subsystem.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket-level failure (handshake, frame, TLS, I/O)
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// General connection error with descriptive message
    #[error("connection error: {0}")]
    Connection(String),

    /// Connect or request deadline elapsed
    #[error("operation timed out")]
    Timeout,

    /// Malformed or undecodable frame; logged and dropped, never fatal
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reconnect attempts exhausted; terminal until the caller reconnects
    #[error("reconnect attempts exhausted after {0} tries")]
    Capacity(u32),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed endpoint URL
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Attempted operation while not connected to the server
    #[error("not connected")]
    NotConnected,
}

/// Convenience type alias for `Result<T, SessionError>`.
pub type Result<T> = std::result::Result<T, SessionError>;
