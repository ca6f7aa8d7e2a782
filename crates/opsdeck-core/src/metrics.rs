//! Host metrics published on the telemetry bus.

use serde::{Deserialize, Serialize};

/// Memory usage (percent) above which a snapshot is reported as a warning.
pub const MEMORY_WARN_PERCENT: f64 = 90.0;
/// Disk usage (percent) above which a snapshot is reported as a warning.
pub const DISK_WARN_PERCENT: f64 = 95.0;

/// Point-in-time host metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub cpu_percent: f32,
    pub cpu_count: usize,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub process_count: usize,
    pub uptime_secs: u64,
}

impl SystemSnapshot {
    #[must_use]
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_used, self.memory_total)
    }

    #[must_use]
    pub fn disk_percent(&self) -> f64 {
        percent(self.disk_used, self.disk_total)
    }

    /// Whether memory or disk pressure crosses the warning thresholds.
    #[must_use]
    pub fn is_under_pressure(&self) -> bool {
        self.memory_percent() > MEMORY_WARN_PERCENT || self.disk_percent() > DISK_WARN_PERCENT
    }

    /// One-line human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "cpu {:.1}% ({} cores), mem {:.1}%, disk {:.1}%, {} processes, up {}",
            self.cpu_percent,
            self.cpu_count,
            self.memory_percent(),
            self.disk_percent(),
            self.process_count,
            format_uptime(self.uptime_secs),
        )
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{days}d {hours}h {minutes}m")
}

#[cfg(feature = "metrics")]
pub use sampler::{SamplerConfig, SystemSampler};

#[cfg(feature = "metrics")]
mod sampler {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use sysinfo::{Disks, ProcessesToUpdate, System};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::SystemSnapshot;
    use crate::{TelemetryBus, TelemetryLevel, TelemetryRecord};

    /// Sampler configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SamplerConfig {
        /// Time between samples.
        #[serde(rename = "interval_ms", with = "crate::serde_duration::millis")]
        pub interval: Duration,
        /// Source tag on published records.
        pub source: String,
    }

    impl Default for SamplerConfig {
        fn default() -> Self {
            Self {
                interval: Duration::from_secs(10),
                source: "system".to_string(),
            }
        }
    }

    /// Periodically samples host metrics and publishes them on a bus.
    pub struct SystemSampler {
        token: CancellationToken,
        handle: Option<JoinHandle<()>>,
    }

    impl SystemSampler {
        /// Start sampling. Must be called from within a Tokio runtime.
        #[must_use]
        pub fn spawn(bus: TelemetryBus, config: SamplerConfig) -> Self {
            let token = CancellationToken::new();
            let child = token.child_token();
            let handle = tokio::spawn(async move {
                let mut system = System::new();
                // CPU usage is a delta between two refreshes; prime it.
                system.refresh_cpu_usage();
                loop {
                    tokio::select! {
                        () = child.cancelled() => break,
                        () = tokio::time::sleep(config.interval) => {}
                    }
                    let snapshot = sample(&mut system);
                    let level = if snapshot.is_under_pressure() {
                        TelemetryLevel::Warning
                    } else {
                        TelemetryLevel::Debug
                    };
                    bus.publish_record(
                        TelemetryRecord::new(level, snapshot.summary(), config.source.as_str())
                            .with_metrics(snapshot),
                    );
                }
            });
            Self {
                token,
                handle: Some(handle),
            }
        }

        /// Stop sampling and wait for the task to finish.
        pub async fn stop(mut self) {
            self.token.cancel();
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        }
    }

    impl Drop for SystemSampler {
        fn drop(&mut self) {
            self.token.cancel();
        }
    }

    /// Take one snapshot, refreshing only what it reports.
    pub(super) fn sample(system: &mut System) -> SystemSnapshot {
        system.refresh_cpu_usage();
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, avail), d| {
                (total + d.total_space(), avail + d.available_space())
            });

        SystemSnapshot {
            cpu_percent: system.global_cpu_usage(),
            cpu_count: system.cpus().len(),
            memory_used: system.used_memory(),
            memory_total: system.total_memory(),
            disk_used: disk_total.saturating_sub(disk_available),
            disk_total,
            process_count: system.processes().len(),
            uptime_secs: System::uptime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_thresholds() {
        let mut snapshot = SystemSnapshot {
            memory_used: 50,
            memory_total: 100,
            disk_used: 10,
            disk_total: 100,
            ..SystemSnapshot::default()
        };
        assert!(!snapshot.is_under_pressure());

        snapshot.memory_used = 95;
        assert!(snapshot.is_under_pressure());

        snapshot.memory_used = 10;
        snapshot.disk_used = 96;
        assert!(snapshot.is_under_pressure());
    }

    #[test]
    fn test_zero_totals_do_not_divide() {
        let snapshot = SystemSnapshot::default();
        assert!((snapshot.memory_percent() - 0.0).abs() < f64::EPSILON);
        assert!(!snapshot.is_under_pressure());
    }

    #[test]
    fn test_summary_formats_uptime() {
        let snapshot = SystemSnapshot {
            uptime_secs: 90_061,
            ..SystemSnapshot::default()
        };
        assert!(snapshot.summary().ends_with("up 1d 1h 1m"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_sample_reads_host() {
        let mut system = sysinfo::System::new();
        let snapshot = sampler::sample(&mut system);
        assert!(snapshot.memory_total > 0);
        assert!(snapshot.memory_used <= snapshot.memory_total);
    }
}
