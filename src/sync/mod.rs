//! Keeps the local store in step with the remote service.

pub mod engine;
pub mod scheduler;

pub use engine::{SyncConfig, SyncEngine, SyncMode, SyncPhase, SyncReport, SyncStatus};
pub use scheduler::{startup_decision, SchedulerConfig, StartupDecision, SyncHandle, SyncScheduler};
