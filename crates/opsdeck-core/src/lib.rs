//! Core abstractions for multi-backend session management.
//!
//! This crate provides the fundamental building blocks:
//! - `Session`, `SessionKey`, `CommandRecord` - the session data model
//! - `BackendAdapter` - trait implemented once per control-plane backend
//! - `TelemetryBus` - filtered publish/subscribe channel for log and metric events
//! - `SystemSampler` - host metrics published on the bus (feature: metrics)

pub mod metrics;
pub mod serde_duration;
pub mod session;
pub mod telemetry;
pub mod traits;

pub use metrics::SystemSnapshot;
#[cfg(feature = "metrics")]
pub use metrics::{SamplerConfig, SystemSampler};
pub use session::{CommandRecord, Session, SessionKey, SessionKind};
pub use telemetry::{
    BusConfig, BusStats, DisplayPolicy, SubscriptionId, TelemetryBus, TelemetryLevel,
    TelemetryPublisher, TelemetryRecord,
};
pub use traits::{BackendAdapter, BackendError};
