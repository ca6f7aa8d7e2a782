//! Console configuration loaded from TOML.
//!
//! ```toml
//! [scheduler]
//! poll_interval_ms = 5000
//!
//! [telemetry]
//! threshold = "warning"
//!
//! [sliver]
//! config_path = "/home/op/.sliver-client/configs/op.cfg"
//!
//! [metasploit]
//! ```
//!
//! Every section is optional. A backend is enabled only when its section is
//! present, even if empty.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use opsdeck_backends::{MetasploitAdapter, MetasploitConfig, SliverAdapter, SliverConfig};
use opsdeck_core::{BackendAdapter, BusConfig, SamplerConfig, TelemetryBus};
use opsdeck_resilience::{InvokerConfig, RateLimitConfig, RateLimiter, ResilientInvoker};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{registry::RegistryConfig, scheduler::SchedulerConfig};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level console configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
    pub telemetry: BusConfig,
    /// Limit applied to each backend resource.
    pub rate_limit: RateLimitConfig,
    pub invoker: InvokerConfig,
    pub sampler: SamplerConfig,
    pub sliver: Option<SliverConfig>,
    pub metasploit: Option<MetasploitConfig>,
}

impl ConsoleConfig {
    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Default location: `<config dir>/opsdeck/console.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("opsdeck").join("console.toml"))
    }

    /// Invoker sharing one limiter across all backends, reporting retries on `bus` if given.
    #[must_use]
    pub fn build_invoker(&self, bus: Option<&TelemetryBus>) -> ResilientInvoker {
        let invoker = ResilientInvoker::new(Arc::new(RateLimiter::new(self.rate_limit)), self.invoker.clone());
        match bus {
            Some(bus) => invoker.with_telemetry(bus),
            None => invoker,
        }
    }

    /// Adapters for the enabled backends, reporting skipped listing records on `bus` if given.
    #[must_use]
    pub fn adapters(&self, bus: Option<&TelemetryBus>) -> Vec<Arc<dyn BackendAdapter>> {
        let mut adapters: Vec<Arc<dyn BackendAdapter>> = Vec::new();
        if let Some(ref sliver) = self.sliver {
            let adapter = SliverAdapter::new(sliver.clone());
            adapters.push(Arc::new(match bus {
                Some(bus) => adapter.with_telemetry(bus),
                None => adapter,
            }));
        }
        if let Some(ref metasploit) = self.metasploit {
            let adapter = MetasploitAdapter::new(metasploit.clone());
            adapters.push(Arc::new(match bus {
                Some(bus) => adapter.with_telemetry(bus),
                None => adapter,
            }));
        }
        adapters
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opsdeck_core::TelemetryLevel;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConsoleConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(5));
        assert_eq!(config.registry.command_retries, 2);
        assert_eq!(config.registry.max_history, Some(500));
        assert_eq!(config.rate_limit, RateLimitConfig::per_minute(30));
        assert_eq!(config.telemetry.history_limit, 1000);
        assert_eq!(config.sampler.interval, Duration::from_secs(10));
        assert!(!config.invoker.wait_on_limit);
        assert!(config.adapters(None).is_empty());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = ConsoleConfig::from_toml_str(
            r#"
            [scheduler]
            poll_interval_ms = 1000

            [registry]
            stale_after_failed_polls = 5

            [telemetry]
            threshold = "warning"
            keywords = ["Session"]

            [rate_limit]
            max_requests = 10
            window_ms = 1000

            [invoker]
            wait_on_limit = true

            [invoker.backoff]
            base_ms = 200
            jitter = false

            [sliver]
            server_port = 8443

            [metasploit]
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(1));
        assert_eq!(config.scheduler.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.registry.stale_after_failed_polls, 5);
        assert_eq!(config.telemetry.threshold, TelemetryLevel::Warning);
        assert_eq!(config.rate_limit, RateLimitConfig::new(10, Duration::from_secs(1)));
        assert!(config.invoker.wait_on_limit);
        assert_eq!(config.invoker.backoff.base, Duration::from_millis(200));
        assert!(!config.invoker.backoff.jitter);
        assert_eq!(config.sliver.as_ref().unwrap().server_port, 8443);

        let names: Vec<String> = config.adapters(None).iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["sliver", "metasploit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_built_invoker_reports_on_bus() {
        let config = ConsoleConfig::from_toml_str("[rate_limit]\nmax_requests = 1\n").unwrap();
        let bus = TelemetryBus::spawn(config.telemetry.clone());
        let invoker = config.build_invoker(Some(&bus));

        assert!(invoker.invoke("sliver", 0, || async { Ok::<_, String>(()) }).await.is_ok());
        assert!(invoker.invoke("sliver", 0, || async { Ok::<_, String>(()) }).await.is_err());

        assert!(bus.shutdown(Duration::from_secs(1)).await);
        let records = bus.recent(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "invoker");
        assert_eq!(config.adapters(Some(&bus)).len(), 0);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = ConsoleConfig::from_toml_str("[scheduler]\npoll_interval_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.toml");
        fs::write(&path, "[metasploit]\nconsole = \"/opt/msf/msfconsole\"\n").unwrap();

        let config = ConsoleConfig::from_file(&path).unwrap();
        assert_eq!(config.metasploit.unwrap().console, "/opt/msf/msfconsole");

        let missing = ConsoleConfig::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
