// Module declarations
mod monitor;
mod status;

// Public API exports
pub use monitor::{HealthEvent, HealthMonitor, MonitorProfile};
pub use status::HealthStatus;
