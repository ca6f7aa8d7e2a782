//! Backend adapter trait and its error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::Session;

/// Backend error.
///
/// Adapters convert every internal failure into one of these at their
/// boundary; nothing panics across [`BackendAdapter`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("malformed record: {0}")]
    ParseError(String),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only connectivity failures qualify: a command that reached the backend
    /// and failed or timed out must not be re-issued.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Trait for control-plane backends.
///
/// One implementation per backend. The registry keeps adapters behind
/// `Arc<dyn BackendAdapter>` keyed by [`BackendAdapter::name`] and never
/// inspects concrete types.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Stable backend name; becomes [`crate::SessionKey::backend`].
    fn name(&self) -> &str;

    /// List sessions currently known to the backend.
    ///
    /// Malformed records are skipped; only a connectivity failure is an error.
    async fn list_sessions(&self) -> Result<Vec<Session>, BackendError>;

    /// Run a command on a session, bounded by `timeout`.
    ///
    /// `Ok` carries the command output, `Err` a human-readable failure.
    async fn run_command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, BackendError>;

    /// Launch an independent interactive shell for a session.
    ///
    /// Best effort: returns once the process is spawned, after at most a
    /// configured grace period spent watching for an early exit. Gives no
    /// guarantee that it outlives the caller.
    async fn open_interactive_shell(&self, session_id: &str) -> Result<(), BackendError>;

    /// Cheap probe with a bounded timeout, used before registration.
    async fn check_connectivity(&self) -> bool;
}
