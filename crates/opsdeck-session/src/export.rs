//! Point-in-time JSON export of the registry.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local, Utc};
use opsdeck_core::Session;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::SessionRegistry;

/// Export error.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize sessions: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Exported document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub exported_at: DateTime<Utc>,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub backends: Vec<String>,
    pub sessions: Vec<Session>,
}

/// `dir/sessions_<YYYYmmdd_HHMMSS>.json` in local time.
#[must_use]
pub fn default_export_path(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref()
        .join(format!("sessions_{}.json", Local::now().format("%Y%m%d_%H%M%S")))
}

impl SessionRegistry {
    /// Snapshot every session, active or not.
    #[must_use]
    pub fn export_document(&self) -> ExportDocument {
        let sessions = self.all_sessions();
        ExportDocument {
            exported_at: Utc::now(),
            total_sessions: sessions.len(),
            active_sessions: sessions.iter().filter(|s| s.active).count(),
            backends: self.backends(),
            sessions,
        }
    }

    /// Write [`Self::export_document`] as pretty JSON to `path`.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    /// Returns error if serialization or any filesystem step fails.
    pub fn export_sessions(&self, path: impl AsRef<Path>) -> Result<PathBuf, ExportError> {
        let path = path.as_ref();
        let io_err = |source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        };

        let json = serde_json::to_string_pretty(&self.export_document())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, json).map_err(io_err)?;

        tracing::info!(path = %path.display(), "Sessions exported");
        Ok(path.to_path_buf())
    }
}
