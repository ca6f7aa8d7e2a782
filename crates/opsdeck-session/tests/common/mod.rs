//! Shared fixtures for the registry and scheduler integration tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use opsdeck_core::{BackendAdapter, BackendError, Session, SessionKey, SessionKind};
use opsdeck_resilience::{BackoffPolicy, InvokerConfig, RateLimitConfig, RateLimiter, ResilientInvoker};
use opsdeck_session::{RegistryConfig, SessionRegistry};

/// Adapter that replays scripted listings and command results.
///
/// When the listing script runs dry the last successful listing is repeated.
pub struct ScriptedAdapter {
    name: String,
    listings: Mutex<VecDeque<Result<Vec<Session>, BackendError>>>,
    last_listing: Mutex<Vec<Session>>,
    commands: Mutex<VecDeque<Result<String, BackendError>>>,
    reachable: AtomicBool,
    list_delay: Mutex<Option<Duration>>,
    pub list_calls: AtomicU32,
    pub command_calls: AtomicU32,
    pub shell_calls: AtomicU32,
}

impl ScriptedAdapter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            listings: Mutex::new(VecDeque::new()),
            last_listing: Mutex::new(Vec::new()),
            commands: Mutex::new(VecDeque::new()),
            reachable: AtomicBool::new(true),
            list_delay: Mutex::new(None),
            list_calls: AtomicU32::new(0),
            command_calls: AtomicU32::new(0),
            shell_calls: AtomicU32::new(0),
        })
    }

    pub fn push_listing(&self, ids: &[&str]) {
        let sessions = ids.iter().map(|id| session(&self.name, id)).collect();
        self.listings.lock().unwrap().push_back(Ok(sessions));
    }

    pub fn push_listing_failure(&self) {
        self.listings
            .lock()
            .unwrap()
            .push_back(Err(BackendError::BackendUnavailable("connection refused".into())));
    }

    pub fn push_command(&self, result: Result<&str, BackendError>) {
        self.commands.lock().unwrap().push_back(result.map(str::to_string));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn list_count(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn command_count(&self) -> u32 {
        self.command_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.listings.lock().unwrap().pop_front();
        match next {
            Some(Ok(sessions)) => {
                self.last_listing.lock().unwrap().clone_from(&sessions);
                Ok(sessions)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last_listing.lock().unwrap().clone()),
        }
    }

    async fn run_command(
        &self,
        _session_id: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<String, BackendError> {
        self.command_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.commands.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("ran {command}")))
    }

    async fn open_interactive_shell(&self, _session_id: &str) -> Result<(), BackendError> {
        self.shell_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

pub fn session(backend: &str, id: &str) -> Session {
    Session::observed(SessionKey::new(backend, id), "10.0.0.7", SessionKind::Interactive, "root", "web01")
        .with_metadata("os", "linux")
}

/// Invoker without jitter so retry timing is deterministic.
pub fn invoker(limit: RateLimitConfig) -> ResilientInvoker {
    ResilientInvoker::new(
        Arc::new(RateLimiter::new(limit)),
        InvokerConfig {
            wait_on_limit: false,
            backoff: BackoffPolicy {
                base: Duration::from_millis(100),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: false,
            },
        },
    )
}

pub fn registry(config: RegistryConfig) -> SessionRegistry {
    SessionRegistry::new(config, invoker(RateLimitConfig::per_minute(100)))
}
