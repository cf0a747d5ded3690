// Module declarations
mod client;
mod queue;

// Public API exports
pub use client::{SessionClient, SessionClientOptions, SessionEvent};
pub use queue::OutboundQueue;
