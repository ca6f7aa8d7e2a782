//! Headless session watcher.
//!
//! Registers the configured backends, polls them until Ctrl+C and prints
//! operator events as they arrive. On exit the registry is exported to the
//! current directory.
//!
//! Usage: `session-watch [config.toml]`

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use opsdeck_core::{SystemSampler, TelemetryBus, TelemetryRecord};
use opsdeck_session::{ConsoleConfig, PollingScheduler, SessionRegistry, default_export_path};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;

    let bus = TelemetryBus::spawn(config.telemetry.clone());
    bus.subscribe(print_record);
    let sampler = SystemSampler::spawn(bus.clone(), config.sampler.clone());

    let registry = Arc::new(SessionRegistry::new(config.registry.clone(), config.build_invoker(Some(&bus))).with_telemetry(&bus));
    for adapter in config.adapters(Some(&bus)) {
        let name = adapter.name().to_string();
        if let Err(e) = registry.register_adapter(adapter).await {
            tracing::warn!(backend = %name, error = %e, "Backend skipped");
        }
    }
    if registry.backends().is_empty() {
        tracing::warn!("No backend is reachable; polling an empty registry");
    }

    let scheduler = PollingScheduler::new(Arc::clone(&registry), config.scheduler.clone()).with_telemetry(&bus);
    scheduler.start();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    scheduler.stop().await;
    sampler.stop().await;

    let stats = registry.statistics();
    tracing::info!(
        total = stats.total_sessions,
        active = stats.active_sessions,
        backends = ?stats.backends,
        "Final session statistics"
    );
    let path = registry
        .export_sessions(default_export_path("."))
        .context("exporting sessions")?;
    println!("Sessions exported to {}", path.display());

    bus.shutdown(SHUTDOWN_TIMEOUT).await;
    Ok(())
}

fn load_config() -> anyhow::Result<ConsoleConfig> {
    if let Some(path) = std::env::args().nth(1) {
        return ConsoleConfig::from_file(&path).with_context(|| format!("loading {path}"));
    }
    match ConsoleConfig::default_path() {
        Some(path) if path.exists() => {
            ConsoleConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => {
            tracing::info!("No configuration file, enabling every backend with defaults");
            Ok(ConsoleConfig::from_toml_str("[sliver]\n[metasploit]\n")?)
        }
    }
}

fn print_record(record: &TelemetryRecord) {
    println!(
        "{} [{:>8}] {:<9} {}",
        record.timestamp.format("%H:%M:%S"),
        record.level.to_string(),
        record.source,
        record.message
    );
}
