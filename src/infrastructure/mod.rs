// Infrastructure module - backoff timing and background-task lifecycle
pub mod backoff;
pub mod task_manager;

pub use backoff::Backoff;
pub use task_manager::TaskManager;
