//! Unified view of sessions across every registered backend.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::Utc;
use opsdeck_core::{
    BackendAdapter, BackendError, CommandRecord, Session, SessionKey, TelemetryBus, TelemetryLevel,
    TelemetryPublisher,
};
use opsdeck_resilience::{InvokeError, InvokerConfig, RateLimiter, ResilientInvoker};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reply text for an unknown session key.
pub const SESSION_NOT_FOUND: &str = "session not found";

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("backend not registered: {0}")]
    BackendNotRegistered(String),
    #[error("backend already registered: {0}")]
    DuplicateBackend(String),
    #[error("invalid backend name {0:?}: must be non-empty and contain no '_'")]
    InvalidBackendName(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("rate limit exceeded for {resource}, retry after {retry_after:?}")]
    RateLimitExceeded {
        resource: String,
        retry_after: Duration,
    },
}

impl From<InvokeError<BackendError>> for RegistryError {
    fn from(err: InvokeError<BackendError>) -> Self {
        match err {
            InvokeError::RateLimitExceeded {
                resource,
                retry_after,
            } => Self::RateLimitExceeded {
                resource,
                retry_after,
            },
            InvokeError::Operation(e) => Self::Backend(e),
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Default bound on a single remote command.
    #[serde(rename = "command_timeout_ms", with = "opsdeck_core::serde_duration::millis")]
    pub command_timeout: Duration,
    /// Retries after the first attempt, for connectivity failures only.
    pub command_retries: u32,
    /// Command records kept per session; `None` keeps everything.
    pub max_history: Option<usize>,
    /// Consecutive failed polls after which a backend's sessions go inactive.
    pub stale_after_failed_polls: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            command_retries: 2,
            max_history: Some(500),
            stale_after_failed_polls: 3,
        }
    }
}

/// Outcome of a remote command, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    pub success: bool,
    pub output: String,
}

impl<E: fmt::Display> From<Result<String, E>> for CommandReply {
    fn from(result: Result<String, E>) -> Self {
        match result {
            Ok(output) => Self {
                success: true,
                output,
            },
            Err(e) => Self {
                success: false,
                output: e.to_string(),
            },
        }
    }
}

/// One backend's listing for a poll cycle.
#[derive(Debug, Clone)]
pub struct BackendPoll {
    pub backend: String,
    pub outcome: Result<Vec<Session>, BackendError>,
}

/// What a merged poll cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Sessions reported by backends this cycle.
    pub observed: usize,
    pub added: Vec<SessionKey>,
    /// Previously inactive sessions seen again.
    pub reactivated: Vec<SessionKey>,
    /// Sessions that went inactive this cycle.
    pub lost: Vec<SessionKey>,
    /// Backends whose listing failed.
    pub failed: Vec<String>,
}

/// Active-session counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    pub total_sessions: usize,
    pub active_sessions: usize,
    /// Registered backends.
    pub backends: Vec<String>,
    pub by_backend: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub by_os: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct BackendHealth {
    consecutive_failures: u32,
    degraded: bool,
}

/// Registry of sessions reported by backend adapters.
///
/// Sessions are only ever deactivated, never deleted, by polling. Readers get
/// copies; no lock is held across a backend call.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionKey, Session>>,
    adapters: RwLock<BTreeMap<String, Arc<dyn BackendAdapter>>>,
    health: Mutex<HashMap<String, BackendHealth>>,
    invoker: ResilientInvoker,
    telemetry: Option<TelemetryPublisher>,
    config: RegistryConfig,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &read(&self.sessions).len())
            .field("backends", &self.backends())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(
            RegistryConfig::default(),
            ResilientInvoker::new(Arc::new(RateLimiter::default()), InvokerConfig::default()),
        )
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig, invoker: ResilientInvoker) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            adapters: RwLock::new(BTreeMap::new()),
            health: Mutex::new(HashMap::new()),
            invoker,
            telemetry: None,
            config,
        }
    }

    /// Publish operator events on `bus` under the `registry` source.
    #[must_use]
    pub fn with_telemetry(mut self, bus: &TelemetryBus) -> Self {
        self.telemetry = Some(bus.publisher("registry"));
        self
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub const fn invoker(&self) -> &ResilientInvoker {
        &self.invoker
    }

    // -- Adapters --

    /// Register an adapter after a successful connectivity probe.
    ///
    /// # Errors
    /// [`RegistryError::DuplicateBackend`] if the name is taken, or
    /// [`BackendError::BackendUnavailable`] if the probe fails.
    pub async fn register_adapter(&self, adapter: Arc<dyn BackendAdapter>) -> Result<(), RegistryError> {
        let name = adapter.name().to_string();
        validate_backend_name(&name)?;
        if read(&self.adapters).contains_key(&name) {
            return Err(RegistryError::DuplicateBackend(name));
        }
        if !adapter.check_connectivity().await {
            self.notify(TelemetryLevel::Warning, format!("{name} is not reachable, not registered"));
            return Err(BackendError::BackendUnavailable(format!("{name} failed connectivity check")).into());
        }
        self.register_adapter_unchecked(adapter)
    }

    /// Register an adapter without probing it.
    ///
    /// # Errors
    /// [`RegistryError::InvalidBackendName`] if the name could not be told
    /// apart inside a `backend_localid` key, or
    /// [`RegistryError::DuplicateBackend`] if the name is taken.
    pub fn register_adapter_unchecked(&self, adapter: Arc<dyn BackendAdapter>) -> Result<(), RegistryError> {
        let name = adapter.name().to_string();
        validate_backend_name(&name)?;
        {
            let mut adapters = write(&self.adapters);
            if adapters.contains_key(&name) {
                return Err(RegistryError::DuplicateBackend(name));
            }
            adapters.insert(name.clone(), adapter);
        }
        lock(&self.health).remove(&name);
        tracing::info!(backend = %name, "Backend registered");
        self.notify(TelemetryLevel::Info, format!("backend {name} registered"));
        Ok(())
    }

    /// Unregister an adapter. Its sessions go inactive on the next poll.
    pub fn remove_adapter(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        let removed = write(&self.adapters).remove(name);
        if removed.is_some() {
            lock(&self.health).remove(name);
            tracing::info!(backend = %name, "Backend removed");
            self.notify(TelemetryLevel::Info, format!("backend {name} removed"));
        }
        removed
    }

    /// Names of registered backends, sorted.
    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        read(&self.adapters).keys().cloned().collect()
    }

    /// Snapshot of the registered adapters.
    #[must_use]
    pub fn adapters(&self) -> Vec<Arc<dyn BackendAdapter>> {
        read(&self.adapters).values().cloned().collect()
    }

    fn adapter(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        read(&self.adapters).get(name).cloned()
    }

    // -- Reads --

    /// Active sessions, sorted by key.
    #[must_use]
    pub fn get_all_sessions(&self) -> Vec<Session> {
        read(&self.sessions)
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    /// Every known session, including inactive ones, sorted by key.
    #[must_use]
    pub fn all_sessions(&self) -> Vec<Session> {
        read(&self.sessions).values().cloned().collect()
    }

    /// Look up a session by its `backend_localid` key.
    ///
    /// The backend part ends at the first `_`.
    #[must_use]
    pub fn get_session(&self, key: &str) -> Option<Session> {
        let sessions = read(&self.sessions);
        find_key(&sessions, key).and_then(|k| sessions.get(&k).cloned())
    }

    /// Exact lookup by composite key.
    #[must_use]
    pub fn get_session_by_key(&self, key: &SessionKey) -> Option<Session> {
        read(&self.sessions).get(key).cloned()
    }

    /// Delete a session and its history.
    pub fn remove_session(&self, key: &str) -> Option<Session> {
        let mut sessions = write(&self.sessions);
        let removed = find_key(&sessions, key).and_then(|k| sessions.remove(&k));
        drop(sessions);
        if let Some(ref session) = removed {
            tracing::debug!(key = %session.key, "Session removed");
        }
        removed
    }

    #[must_use]
    pub fn statistics(&self) -> SessionStatistics {
        let sessions = read(&self.sessions);
        let mut stats = SessionStatistics {
            total_sessions: sessions.len(),
            backends: self.backends(),
            ..SessionStatistics::default()
        };
        for session in sessions.values().filter(|s| s.active) {
            stats.active_sessions += 1;
            *stats.by_backend.entry(session.key.backend.clone()).or_default() += 1;
            *stats.by_kind.entry(session.kind.to_string()).or_default() += 1;
            let os = session.metadata("os").unwrap_or("unknown").to_string();
            *stats.by_os.entry(os).or_default() += 1;
        }
        stats
    }

    // -- Commands --

    /// Run a command on a session; failures become an unsuccessful reply.
    ///
    /// `timeout` defaults to [`RegistryConfig::command_timeout`].
    pub async fn execute_command(&self, key: &str, command: &str, timeout: Option<Duration>) -> CommandReply {
        match self.try_execute_command(key, command, timeout).await {
            Err(RegistryError::SessionNotFound(_)) => CommandReply {
                success: false,
                output: SESSION_NOT_FOUND.to_string(),
            },
            other => other.into(),
        }
    }

    /// Run a command on a session through the invoker.
    ///
    /// Only connectivity failures are retried. Whenever the session exists,
    /// the outcome is appended to its history, including refusals that never
    /// reached the backend.
    ///
    /// # Errors
    /// Unknown session or backend, rate limiting, or the backend's failure.
    pub async fn try_execute_command(
        &self,
        key: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, RegistryError> {
        let session_key = self.lookup(key)?;
        let timeout = timeout.unwrap_or(self.config.command_timeout);

        let result = match self.adapter(&session_key.backend) {
            Some(adapter) => {
                let local_id = session_key.local_id.as_str();
                let adapter = adapter.as_ref();
                self.invoker
                    .invoke_with(
                        &session_key.backend,
                        self.config.command_retries,
                        BackendError::is_transient,
                        move || adapter.run_command(local_id, command, timeout),
                    )
                    .await
                    .map_err(RegistryError::from)
            }
            None => Err(RegistryError::BackendNotRegistered(session_key.backend.clone())),
        };

        self.record_command(&session_key, command, &result);
        if let Err(ref e) = result {
            tracing::warn!(key = %session_key, command, error = %e, "Command failed");
        }
        result
    }

    /// Open an interactive shell for a session. Best-effort.
    pub async fn open_shell(&self, key: &str) -> bool {
        match self.try_open_shell(key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to open shell");
                self.notify(TelemetryLevel::Warning, format!("could not open shell for {key}: {e}"));
                false
            }
        }
    }

    /// Open an interactive shell, reporting why it failed.
    ///
    /// # Errors
    /// Unknown session or backend, rate limiting, or a failed spawn.
    pub async fn try_open_shell(&self, key: &str) -> Result<(), RegistryError> {
        let (session_key, adapter) = self.resolve(key)?;
        let local_id = session_key.local_id.as_str();
        let adapter = adapter.as_ref();
        self.invoker
            .invoke(&session_key.backend, 0, move || adapter.open_interactive_shell(local_id))
            .await?;
        Ok(())
    }

    fn lookup(&self, key: &str) -> Result<SessionKey, RegistryError> {
        find_key(&read(&self.sessions), key).ok_or_else(|| RegistryError::SessionNotFound(key.to_string()))
    }

    fn resolve(&self, key: &str) -> Result<(SessionKey, Arc<dyn BackendAdapter>), RegistryError> {
        let session_key = self.lookup(key)?;
        let adapter = self
            .adapter(&session_key.backend)
            .ok_or_else(|| RegistryError::BackendNotRegistered(session_key.backend.clone()))?;
        Ok((session_key, adapter))
    }

    fn record_command(&self, key: &SessionKey, command: &str, result: &Result<String, RegistryError>) {
        let mut sessions = write(&self.sessions);
        let Some(session) = sessions.get_mut(key) else {
            return;
        };
        let record = match result {
            Ok(output) => CommandRecord::new(command, true, output),
            Err(e) => CommandRecord::new(command, false, &e.to_string()),
        };
        session.push_history(record, self.config.max_history);
        if result.is_ok() {
            session.last_seen_at = Utc::now();
        }
    }

    // -- Polling --

    /// Merge one poll cycle into the registry.
    ///
    /// A succeeding backend's sessions are updated or inserted and its missing
    /// sessions deactivated. A failing backend's sessions are left alone until
    /// it has failed [`RegistryConfig::stale_after_failed_polls`] times in a
    /// row. Sessions of backends that were neither polled nor are registered
    /// are deactivated.
    pub fn apply_poll(&self, polls: Vec<BackendPoll>) -> PollReport {
        let registered: HashSet<String> = read(&self.adapters).keys().cloned().collect();
        let mut report = PollReport::default();
        let mut events: Vec<(TelemetryLevel, String)> = Vec::new();
        let polled: HashSet<String> = polls.iter().map(|p| p.backend.clone()).collect();
        let mut succeeded = HashSet::new();
        let mut degraded = HashSet::new();
        let mut observed = Vec::new();

        {
            let mut health = lock(&self.health);
            for BackendPoll { backend, outcome } in polls {
                let entry = health.entry(backend.clone()).or_default();
                match outcome {
                    Ok(sessions) => {
                        if entry.degraded {
                            events.push((TelemetryLevel::Info, format!("backend {backend} recovered")));
                        }
                        *entry = BackendHealth::default();
                        observed.extend(sessions);
                        succeeded.insert(backend);
                    }
                    Err(e) => {
                        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                        let threshold = self.config.stale_after_failed_polls.max(1);
                        tracing::warn!(backend = %backend, failures = entry.consecutive_failures, error = %e, "Backend poll failed");
                        events.push((
                            TelemetryLevel::Warning,
                            format!(
                                "poll of {backend} failed ({}/{threshold}): {e}",
                                entry.consecutive_failures
                            ),
                        ));
                        if entry.consecutive_failures >= threshold && !entry.degraded {
                            entry.degraded = true;
                            events.push((
                                TelemetryLevel::Warning,
                                format!("backend {backend} is stale, its sessions are now inactive"),
                            ));
                            degraded.insert(backend.clone());
                        }
                        report.failed.push(backend);
                    }
                }
            }
        }

        let observed_keys: HashSet<SessionKey> = observed.iter().map(|s| s.key.clone()).collect();
        let mut sessions = write(&self.sessions);

        for session in sessions.values_mut().filter(|s| s.active) {
            let backend = &session.key.backend;
            let lost = if succeeded.contains(backend) {
                !observed_keys.contains(&session.key)
            } else if polled.contains(backend) {
                degraded.contains(backend)
            } else {
                !registered.contains(backend)
            };
            if lost {
                session.active = false;
                report.lost.push(session.key.clone());
            }
        }

        for session in observed {
            report.observed += 1;
            if let Some(existing) = sessions.get_mut(&session.key) {
                if !existing.active && !report.reactivated.contains(&existing.key) {
                    report.reactivated.push(existing.key.clone());
                }
                existing.absorb(session);
            } else {
                events.push((
                    TelemetryLevel::Info,
                    format!(
                        "new session {} ({} at {})",
                        session.key, session.principal, session.target_address
                    ),
                ));
                report.added.push(session.key.clone());
                sessions.insert(session.key.clone(), session);
            }
        }
        drop(sessions);

        for key in &report.reactivated {
            events.push((TelemetryLevel::Info, format!("session {key} is back")));
        }
        for key in &report.lost {
            events.push((TelemetryLevel::Info, format!("session {key} lost")));
        }
        for (level, message) in events {
            self.notify(level, message);
        }

        tracing::debug!(
            observed = report.observed,
            added = report.added.len(),
            lost = report.lost.len(),
            failed = report.failed.len(),
            "Poll merged"
        );
        report
    }

    fn notify(&self, level: TelemetryLevel, message: String) {
        if let Some(ref telemetry) = self.telemetry {
            telemetry.publish(level, message);
        }
    }
}

/// Split a `backend_localid` string at its first `_` and look it up.
fn find_key(sessions: &BTreeMap<SessionKey, Session>, key: &str) -> Option<SessionKey> {
    let (backend, local_id) = key.split_once('_')?;
    let key = SessionKey::new(backend, local_id);
    sessions.contains_key(&key).then_some(key)
}

fn validate_backend_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.contains('_') {
        return Err(RegistryError::InvalidBackendName(name.to_string()));
    }
    Ok(())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
