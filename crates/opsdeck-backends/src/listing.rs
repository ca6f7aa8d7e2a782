//! Outcome of parsing one backend listing.

use opsdeck_core::{Session, TelemetryPublisher};

/// Sessions recovered from a listing, plus one note per record that was dropped.
#[derive(Debug, Default)]
pub struct ParsedListing {
    pub sessions: Vec<Session>,
    pub skipped: Vec<String>,
}

impl ParsedListing {
    /// Publish a warning for every skipped record and keep the sessions.
    #[must_use]
    pub fn into_sessions(self, telemetry: Option<&TelemetryPublisher>) -> Vec<Session> {
        if let Some(telemetry) = telemetry {
            for reason in &self.skipped {
                telemetry.warning(format!("skipped listing record: {reason}"));
            }
        }
        self.sessions
    }
}
