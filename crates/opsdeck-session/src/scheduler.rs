//! Background polling of every registered backend.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use opsdeck_core::{BackendError, TelemetryBus, TelemetryPublisher};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::{BackendPoll, PollReport, SessionRegistry};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time between the end of one cycle and the start of the next.
    #[serde(rename = "poll_interval_ms", with = "opsdeck_core::serde_duration::millis")]
    pub poll_interval: Duration,
    /// Bound on one adapter's listing; a slower adapter counts as failed.
    #[serde(rename = "list_timeout_ms", with = "opsdeck_core::serde_duration::millis")]
    pub list_timeout: Duration,
    /// How long `stop` waits for the loop before abandoning it.
    #[serde(rename = "stop_timeout_ms", with = "opsdeck_core::serde_duration::millis")]
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            list_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    StopRequested,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Polls the registry's adapters on a fixed interval and merges the results.
///
/// `Stopped -> Running -> StopRequested -> Stopped`.
pub struct PollingScheduler {
    registry: Arc<SessionRegistry>,
    config: SchedulerConfig,
    telemetry: Option<TelemetryPublisher>,
    state: Mutex<SchedulerState>,
    worker: Mutex<Option<Worker>>,
}

impl fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PollingScheduler {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            config,
            telemetry: None,
            state: Mutex::new(SchedulerState::Stopped),
            worker: Mutex::new(None),
        }
    }

    /// Publish operator events on `bus` under the `scheduler` source.
    #[must_use]
    pub fn with_telemetry(mut self, bus: &TelemetryBus) -> Self {
        self.telemetry = Some(bus.publisher("scheduler"));
        self
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start the poll loop. No-op unless stopped.
    ///
    /// The first cycle runs immediately. Must be called from within a Tokio
    /// runtime.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        if *state != SchedulerState::Stopped {
            tracing::debug!(state = ?*state, "Scheduler already started");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.registry),
            self.config.clone(),
            token.child_token(),
        ));
        *lock(&self.worker) = Some(Worker { token, handle });
        *state = SchedulerState::Running;
        drop(state);

        tracing::info!(interval = ?self.config.poll_interval, "Session polling started");
        if let Some(ref telemetry) = self.telemetry {
            telemetry.info("session polling started");
        }
    }

    /// Stop the poll loop, waiting up to the configured stop timeout.
    ///
    /// Returns `true` if the loop finished in time. Either way the scheduler
    /// ends up stopped; a loop that did not finish is aborted.
    pub async fn stop(&self) -> bool {
        let worker = {
            let mut state = lock(&self.state);
            if *state != SchedulerState::Running {
                return true;
            }
            *state = SchedulerState::StopRequested;
            lock(&self.worker).take()
        };

        let joined = match worker {
            Some(Worker { token, mut handle }) => {
                token.cancel();
                if tokio::time::timeout(self.config.stop_timeout, &mut handle).await.is_ok() {
                    true
                } else {
                    tracing::warn!(timeout = ?self.config.stop_timeout, "Poll loop did not stop in time, aborting");
                    handle.abort();
                    false
                }
            }
            None => true,
        };

        *lock(&self.state) = SchedulerState::Stopped;
        tracing::info!(joined, "Session polling stopped");
        if let Some(ref telemetry) = self.telemetry {
            if joined {
                telemetry.info("session polling stopped");
            } else {
                telemetry.warning("session polling stopped after timeout");
            }
        }
        joined
    }

    /// Run one poll cycle now, independent of the loop.
    pub async fn poll_once(&self) -> PollReport {
        poll_cycle(&self.registry, self.config.list_timeout).await
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.worker).take() {
            worker.token.cancel();
        }
    }
}

async fn poll_loop(registry: Arc<SessionRegistry>, config: SchedulerConfig, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }
        // In-flight listings run to completion; `stop` bounds the wait.
        poll_cycle(&registry, config.list_timeout).await;
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(config.poll_interval) => {}
        }
    }
    tracing::debug!("Poll loop exited");
}

/// Poll every adapter concurrently and merge the results.
async fn poll_cycle(registry: &SessionRegistry, list_timeout: Duration) -> PollReport {
    let adapters = registry.adapters();
    let polls = join_all(adapters.iter().map(|adapter| async move {
        let backend = adapter.name().to_string();
        let outcome = match tokio::time::timeout(list_timeout, adapter.list_sessions()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::CommandTimeout(list_timeout)),
        };
        BackendPoll { backend, outcome }
    }))
    .await;
    registry.apply_poll(polls)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
