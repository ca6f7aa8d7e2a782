//! Session data model shared by adapters and the registry.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of characters kept in [`CommandRecord::output_ref`].
pub const OUTPUT_EXCERPT_CHARS: usize = 256;

/// Composite session identity: owning backend plus the backend's own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    /// Name of the backend that owns the session.
    pub backend: String,
    /// Identifier assigned by the backend.
    pub local_id: String,
}

impl SessionKey {
    /// Create a key.
    #[must_use]
    pub fn new(backend: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.backend, self.local_id)
    }
}

/// How a session talks back to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Live, interactive connection.
    Interactive,
    /// Periodic check-in.
    Beacon,
    /// Anything the backend reports that fits neither.
    Other,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interactive => "interactive",
            Self::Beacon => "beacon",
            Self::Other => "other",
        })
    }
}

/// One entry of a session's command history. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    pub issued_at: DateTime<Utc>,
    pub succeeded: bool,
    /// Bounded excerpt of the command output (or error text).
    pub output_ref: Option<String>,
}

impl CommandRecord {
    /// Build a record, truncating `output` to [`OUTPUT_EXCERPT_CHARS`].
    #[must_use]
    pub fn new(command: impl Into<String>, succeeded: bool, output: &str) -> Self {
        let output_ref = if output.is_empty() {
            None
        } else {
            Some(output.chars().take(OUTPUT_EXCERPT_CHARS).collect())
        };
        Self {
            command: command.into(),
            issued_at: Utc::now(),
            succeeded,
            output_ref,
        }
    }
}

/// A remote endpoint reachable, now or formerly, through a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key: SessionKey,
    pub target_address: String,
    pub kind: SessionKind,
    /// `username@hostname`.
    pub principal: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
    /// Backend-specific attributes (os, arch, process, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub command_history: Vec<CommandRecord>,
}

impl Session {
    /// A freshly observed session as reported by a backend listing.
    #[must_use]
    pub fn observed(
        key: SessionKey,
        target_address: impl Into<String>,
        kind: SessionKind,
        username: &str,
        hostname: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            target_address: target_address.into(),
            kind,
            principal: principal(username, hostname),
            created_at: now,
            last_seen_at: now,
            active: true,
            metadata: BTreeMap::new(),
            command_history: Vec::new(),
        }
    }

    /// Attach a metadata value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Refresh this entry from a newer observation of the same endpoint.
    ///
    /// Identity, `created_at` and history are preserved.
    pub fn absorb(&mut self, observed: Self) {
        self.target_address = observed.target_address;
        self.kind = observed.kind;
        self.principal = observed.principal;
        self.metadata = observed.metadata;
        self.last_seen_at = observed.last_seen_at;
        self.active = true;
    }

    /// Append to the history, dropping the oldest entries beyond `limit`.
    pub fn push_history(&mut self, record: CommandRecord, limit: Option<usize>) {
        self.command_history.push(record);
        if let Some(limit) = limit {
            let excess = self.command_history.len().saturating_sub(limit);
            if excess > 0 {
                self.command_history.drain(..excess);
            }
        }
    }
}

fn principal(username: &str, hostname: &str) -> String {
    let username = if username.trim().is_empty() { "unknown" } else { username.trim() };
    let hostname = if hostname.trim().is_empty() { "unknown" } else { hostname.trim() };
    format!("{username}@{hostname}")
}
