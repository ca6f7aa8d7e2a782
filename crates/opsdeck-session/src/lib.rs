//! Session orchestration across control-plane backends.
//!
//! Provides:
//! - `SessionRegistry` - merged view of every backend's sessions, command dispatch
//! - `PollingScheduler` - background polling with bounded shutdown
//! - JSON export and statistics
//! - `ConsoleConfig` - TOML configuration for the whole stack

pub mod config;
pub mod export;
pub mod registry;
pub mod scheduler;

pub use config::{ConfigError, ConsoleConfig};
pub use export::{ExportDocument, ExportError, default_export_path};
pub use registry::{
    BackendPoll, CommandReply, PollReport, RegistryConfig, RegistryError, SESSION_NOT_FOUND, SessionRegistry,
    SessionStatistics,
};
pub use scheduler::{PollingScheduler, SchedulerConfig, SchedulerState};
