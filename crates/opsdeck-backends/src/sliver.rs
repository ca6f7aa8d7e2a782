//! Sliver adapter (beacon-style backend).
//!
//! Talks to the operator's `sliver-client` in JSON mode. A listing returns an
//! object with `sessions` and `beacons` arrays; each record is parsed
//! independently so one bad entry does not hide the rest.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use opsdeck_core::{
    BackendAdapter, BackendError, Session, SessionKey, SessionKind, TelemetryBus, TelemetryPublisher,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;

use crate::{
    command::{CommandBuilder, run_client},
    listing::ParsedListing,
    shell::launch_in_terminal,
};

/// Sliver adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SliverConfig {
    /// Backend name used in session keys.
    pub name: String,
    /// Client executable.
    pub client: String,
    /// Operator config file passed with `--config`.
    pub config_path: PathBuf,
    pub server_host: String,
    pub server_port: u16,
    #[serde(rename = "probe_timeout_ms", with = "opsdeck_core::serde_duration::millis")]
    pub probe_timeout: Duration,
    #[serde(rename = "list_timeout_ms", with = "opsdeck_core::serde_duration::millis")]
    pub list_timeout: Duration,
    /// How long `open_interactive_shell` watches the terminal for an early exit. Zero returns at once.
    #[serde(rename = "launch_grace_ms", with = "opsdeck_core::serde_duration::millis")]
    pub launch_grace: Duration,
}

impl Default for SliverConfig {
    fn default() -> Self {
        Self {
            name: "sliver".to_string(),
            client: "sliver-client".to_string(),
            config_path: default_config_path(),
            server_host: "localhost".to_string(),
            server_port: 31337,
            probe_timeout: Duration::from_secs(2),
            list_timeout: Duration::from_secs(5),
            launch_grace: Duration::ZERO,
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opsdeck")
        .join("sliver")
        .join("client.cfg")
}

/// Adapter for a Sliver server reached through `sliver-client`.
#[derive(Debug, Clone)]
pub struct SliverAdapter {
    config: SliverConfig,
    builder: CommandBuilder,
    telemetry: Option<TelemetryPublisher>,
}

impl SliverAdapter {
    #[must_use]
    pub fn new(config: SliverConfig) -> Self {
        let config_arg = config.config_path.to_string_lossy().into_owned();
        let builder = CommandBuilder::new(shlex::try_quote(&config.client).map_or_else(
            |_| config.client.clone(),
            std::borrow::Cow::into_owned,
        ))
        .params(["--config".to_string(), config_arg]);
        Self {
            config,
            builder,
            telemetry: None,
        }
    }

    /// Report skipped listing records on `bus` under the backend name.
    #[must_use]
    pub fn with_telemetry(mut self, bus: &TelemetryBus) -> Self {
        self.telemetry = Some(bus.publisher(self.config.name.as_str()));
        self
    }

    #[must_use]
    pub const fn config(&self) -> &SliverConfig {
        &self.config
    }
}

impl Default for SliverAdapter {
    fn default() -> Self {
        Self::new(SliverConfig::default())
    }
}

#[async_trait]
impl BackendAdapter for SliverAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, BackendError> {
        let parts = self.builder.build(["--json", "sessions"])?;
        let output = run_client(&parts, self.config.list_timeout).await?;
        if !output.success {
            return Err(BackendError::BackendUnavailable(output.failure_text()));
        }
        Ok(parse_listing(&self.config.name, &output.stdout)?.into_sessions(self.telemetry.as_ref()))
    }

    async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let parts = self
            .builder
            .build(["--json", "use", session_id, "--", command])?;
        run_client(&parts, timeout).await?.into_result()
    }

    async fn open_interactive_shell(&self, session_id: &str) -> Result<(), BackendError> {
        let parts = self.builder.build(["use", session_id])?;
        launch_in_terminal(&self.config.name, &parts, self.config.launch_grace).await
    }

    async fn check_connectivity(&self) -> bool {
        let addr = (self.config.server_host.as_str(), self.config.server_port);
        match tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(host = %self.config.server_host, port = self.config.server_port, ?e, "Sliver probe refused");
                false
            }
            Err(_) => {
                tracing::debug!(host = %self.config.server_host, port = self.config.server_port, "Sliver probe timed out");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SliverRecord {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    remote_address: String,
    #[serde(default)]
    is_beacon: bool,
    #[serde(default)]
    username: String,
    #[serde(default)]
    hostname: String,
    #[serde(rename = "OS", default)]
    os: Option<String>,
    #[serde(default)]
    arch: Option<String>,
    #[serde(rename = "PID", default)]
    pid: Option<i64>,
    #[serde(default)]
    process_name: Option<String>,
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    last_checkin: Option<Value>,
}

/// Parse a `sliver-client --json sessions` document.
///
/// Records without an ID or with the wrong shape are skipped and noted.
///
/// # Errors
/// [`BackendError::ParseError`] if the document itself is not a JSON object.
pub fn parse_listing(backend: &str, json: &str) -> Result<ParsedListing, BackendError> {
    let document: Value =
        serde_json::from_str(json).map_err(|e| BackendError::ParseError(e.to_string()))?;
    let Value::Object(document) = document else {
        return Err(BackendError::ParseError("listing is not an object".to_string()));
    };

    let mut listing = ParsedListing::default();
    for (field, beacons) in [("sessions", false), ("beacons", true)] {
        let Some(records) = document.get(field).and_then(Value::as_array) else {
            continue;
        };
        for raw in records {
            match serde_json::from_value::<SliverRecord>(raw.clone()) {
                Ok(record) if !record.id.trim().is_empty() => {
                    listing.sessions.push(record.into_session(backend, beacons));
                }
                Ok(_) => {
                    tracing::warn!(field, "Skipping Sliver record without ID");
                    listing.skipped.push(format!("{field} record without ID"));
                }
                Err(e) => {
                    tracing::warn!(field, error = %e, "Skipping malformed Sliver record");
                    listing.skipped.push(format!("malformed {field} record: {e}"));
                }
            }
        }
    }
    Ok(listing)
}

impl SliverRecord {
    fn into_session(self, backend: &str, from_beacons: bool) -> Session {
        let kind = if from_beacons || self.is_beacon {
            SessionKind::Beacon
        } else {
            SessionKind::Interactive
        };
        let mut session = Session::observed(
            SessionKey::new(backend, self.id),
            host_of(&self.remote_address),
            kind,
            &self.username,
            &self.hostname,
        );

        let metadata = [
            ("os", self.os),
            ("arch", self.arch),
            ("pid", self.pid.map(|p| p.to_string())),
            ("process", self.process_name),
            ("transport", self.transport),
            ("last_checkin", self.last_checkin.map(|v| value_text(&v))),
        ];
        for (key, value) in metadata {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                session = session.with_metadata(key, value);
            }
        }
        session
    }
}

/// Host part of `host:port`, `[v6]:port` or a bare host.
fn host_of(address: &str) -> String {
    let address = address.trim();
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host.to_string();
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => address.to_string(),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
