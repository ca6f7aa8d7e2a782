//! Metasploit adapter (session-style backend).
//!
//! Drives `msfconsole` non-interactively and reads the `sessions -l` table:
//!
//! ```text
//!   Id  Name  Type                     Information                Connection
//!   --  ----  ----                     -----------                ----------
//!   1         meterpreter x86/windows  NT AUTHORITY\SYSTEM @ WIN7  10.0.0.5:4444 -> 10.0.0.9:49158 (10.0.0.9)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use opsdeck_core::{
    BackendAdapter, BackendError, Session, SessionKey, SessionKind, TelemetryBus, TelemetryPublisher,
};
use serde::{Deserialize, Serialize};

use crate::{
    command::{CommandBuilder, run_client},
    listing::ParsedListing,
    shell::{launch_in_terminal, resolve_executable_path},
};

/// Session type tokens that can appear in the `Type` column.
const SESSION_TYPES: [&str; 5] = ["meterpreter", "shell", "powershell", "vnc", "ssh"];

/// Platform words printed after the session type when there is no `arch/os`.
const PLATFORMS: [&str; 10] = [
    "linux", "windows", "unix", "osx", "bsd", "solaris", "android", "java", "php", "python",
];

/// Metasploit adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetasploitConfig {
    /// Backend name used in session keys.
    pub name: String,
    /// Console executable.
    pub console: String,
    #[serde(rename = "list_timeout_ms", with = "opsdeck_core::serde_duration::millis")]
    pub list_timeout: Duration,
    /// See [`crate::SliverConfig::launch_grace`].
    #[serde(rename = "launch_grace_ms", with = "opsdeck_core::serde_duration::millis")]
    pub launch_grace: Duration,
}

impl Default for MetasploitConfig {
    fn default() -> Self {
        Self {
            name: "metasploit".to_string(),
            console: "msfconsole".to_string(),
            list_timeout: Duration::from_secs(10),
            launch_grace: Duration::ZERO,
        }
    }
}

/// Adapter for Metasploit through `msfconsole -q -x`.
#[derive(Debug, Clone)]
pub struct MetasploitAdapter {
    config: MetasploitConfig,
    builder: CommandBuilder,
    telemetry: Option<TelemetryPublisher>,
}

impl MetasploitAdapter {
    #[must_use]
    pub fn new(config: MetasploitConfig) -> Self {
        let base = shlex::try_quote(&config.console)
            .map_or_else(|_| config.console.clone(), std::borrow::Cow::into_owned);
        let builder = CommandBuilder::new(base).params(["-q"]);
        Self {
            config,
            builder,
            telemetry: None,
        }
    }

    /// Report unparseable session rows on `bus` under the backend name.
    #[must_use]
    pub fn with_telemetry(mut self, bus: &TelemetryBus) -> Self {
        self.telemetry = Some(bus.publisher(self.config.name.as_str()));
        self
    }

    #[must_use]
    pub const fn config(&self) -> &MetasploitConfig {
        &self.config
    }

    async fn console(&self, script: String, timeout: Duration) -> Result<crate::command::ClientOutput, BackendError> {
        let parts = self.builder.build(["-x".to_string(), script])?;
        run_client(&parts, timeout).await
    }
}

impl Default for MetasploitAdapter {
    fn default() -> Self {
        Self::new(MetasploitConfig::default())
    }
}

#[async_trait]
impl BackendAdapter for MetasploitAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, BackendError> {
        let output = self
            .console("sessions -l; exit".to_string(), self.config.list_timeout)
            .await?;
        if !output.success {
            return Err(BackendError::BackendUnavailable(output.failure_text()));
        }
        Ok(parse_session_table(&self.config.name, &output.stdout).into_sessions(self.telemetry.as_ref()))
    }

    async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        if !is_session_id(session_id) {
            return Err(BackendError::CommandFailed(format!("invalid session id: {session_id}")));
        }
        let quoted = shlex::try_quote(command)
            .map_err(|e| BackendError::CommandFailed(e.to_string()))?;
        let script = format!("sessions -i {session_id} -C {quoted}; exit");
        let stdout = self.console(script, timeout).await?.into_result()?;
        console_error(&stdout).map_or(Ok(stdout), |line| Err(BackendError::CommandFailed(line)))
    }

    async fn open_interactive_shell(&self, session_id: &str) -> Result<(), BackendError> {
        if !is_session_id(session_id) {
            return Err(BackendError::SpawnFailed(format!("invalid session id: {session_id}")));
        }
        let parts = self
            .builder
            .build(["-x".to_string(), format!("sessions -i {session_id}")])?;
        launch_in_terminal(&self.config.name, &parts, self.config.launch_grace).await
    }

    async fn check_connectivity(&self) -> bool {
        resolve_executable_path(&self.config.console).await.is_some()
    }
}

fn is_session_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// First `[-]` error line the console printed, if any.
fn console_error(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("[-]"))
        .map(|line| line.trim_start_matches("[-]").trim().to_string())
}

/// Parse the `sessions -l` table printed by `msfconsole`.
///
/// Lines that are not session rows are ignored. Rows that start with a
/// session id but cannot be parsed are skipped and noted.
#[must_use]
pub fn parse_session_table(backend: &str, output: &str) -> ParsedListing {
    let mut listing = ParsedListing::default();
    for line in output.lines() {
        match parse_row(backend, line) {
            Some(session) => listing.sessions.push(session),
            None if line.trim_start().starts_with(|c: char| c.is_ascii_digit()) => {
                tracing::warn!(line, "Skipping unparseable Metasploit session row");
                listing.skipped.push(format!("unparseable session row: {}", line.trim()));
            }
            None => {}
        }
    }
    listing
}

fn parse_row(backend: &str, line: &str) -> Option<Session> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let id = *tokens.first()?;
    if !is_session_id(id) {
        return None;
    }

    let arrow = tokens.iter().position(|t| *t == "->")?;
    let remote = tokens.get(arrow + 1)?;
    let via = tokens.get(arrow.checked_sub(1)?)?;

    let type_idx = tokens[1..arrow]
        .iter()
        .position(|t| SESSION_TYPES.contains(t))
        .map_or(1, |i| i + 1);
    if type_idx >= arrow.saturating_sub(1) {
        return None;
    }
    let session_type = tokens[type_idx];
    let name = (type_idx > 1).then(|| tokens[1..type_idx].join(" "));

    let mut info_start = type_idx + 1;
    let platform = tokens
        .get(info_start)
        .filter(|t| info_start < arrow - 1 && (t.contains('/') || PLATFORMS.contains(*t)))
        .copied();
    if platform.is_some() {
        info_start += 1;
    }
    let info = &tokens[info_start..arrow - 1];
    let (username, hostname) = info.iter().position(|t| *t == "@").map_or_else(
        || (String::new(), String::new()),
        |at| (info[..at].join(" "), info[at + 1..].join(" ")),
    );

    let target = tokens
        .get(arrow + 2)
        .and_then(|t| t.strip_prefix('(')?.strip_suffix(')'))
        .map_or_else(|| strip_port(remote), str::to_string);

    let mut session = Session::observed(
        SessionKey::new(backend, id),
        target,
        SessionKind::Interactive,
        &username,
        &hostname,
    )
    .with_metadata("type", session_type)
    .with_metadata("via", *via)
    .with_metadata("remote", *remote);

    if let Some(platform) = platform {
        let (arch, os) = platform.split_once('/').unwrap_or(("", platform));
        session = session.with_metadata("platform", platform);
        if !arch.is_empty() {
            session = session.with_metadata("arch", arch);
        }
        session = session.with_metadata("os", os);
    }
    if let Some(name) = name {
        session = session.with_metadata("name", name);
    }
    Some(session)
}

fn strip_port(address: &str) -> String {
    address
        .rsplit_once(':')
        .filter(|(host, port)| !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()))
        .map_or(address, |(host, _)| host)
        .to_string()
}
