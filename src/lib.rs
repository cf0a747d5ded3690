//! # debug-session-rs
//!
//! A resilient WebSocket session layer for talking to a remote debug server
//! over an unreliable transport. The crate keeps a logical session alive
//! across physical disconnects: it reconnects with capped exponential
//! backoff, detects zombie sockets with an application-level ping/pong
//! heartbeat, queues outbound messages while disconnected, and correlates
//! request/response pairs by message id.
//!
//! ## Example
//!
//! ```no_run
//! use debug_session_rs::{SessionClient, SessionClientOptions, SessionMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SessionClient::new(SessionClientOptions {
//!         client_id: "inspector".to_string(),
//!         ..Default::default()
//!     });
//!
//!     client.connect("ws://127.0.0.1:9229/session").await?;
//!
//!     let reply = client
//!         .send_and_wait(SessionMessage::new("eval", serde_json::json!({"expr": "1+1"})), None)
//!         .await?;
//!     println!("reply: {:?}", reply.payload);
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod health;
pub mod infrastructure;
pub mod registry;
pub mod session;
pub mod types;
pub mod websocket;

pub use connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionOptions, ConnectionState,
};
pub use health::{HealthEvent, HealthMonitor, HealthStatus, MonitorProfile};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, EntryMeta, RegistryOptions};
pub use session::{SessionClient, SessionClientOptions, SessionEvent};
pub use types::{MessageMeta, Result, SessionError, SessionMessage, WireFrame};
