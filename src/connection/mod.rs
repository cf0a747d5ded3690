// Module declarations
mod core;
mod events;
mod state;

// Public API exports
pub use core::Connection;
pub use events::{ConnectionEvent, ConnectionEventKind, EventBus, SubscriptionId};
pub use state::{ConnectionOptions, ConnectionState};
