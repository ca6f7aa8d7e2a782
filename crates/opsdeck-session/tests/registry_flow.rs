mod common;

use std::{sync::Arc, time::Duration};

use common::{ScriptedAdapter, invoker, registry};
use opsdeck_core::{BackendError, BusConfig, TelemetryBus, TelemetryLevel};
use opsdeck_resilience::RateLimitConfig;
use opsdeck_session::{
    PollingScheduler, RegistryConfig, RegistryError, SESSION_NOT_FOUND, SchedulerConfig, SessionRegistry,
};

async fn registry_with_sessions(adapter: &Arc<ScriptedAdapter>, ids: &[&str]) -> Arc<SessionRegistry> {
    let registry = Arc::new(registry(RegistryConfig::default()));
    registry.register_adapter(adapter.clone()).await.unwrap();
    adapter.push_listing(ids);
    PollingScheduler::new(Arc::clone(&registry), SchedulerConfig::default())
        .poll_once()
        .await;
    registry
}

#[tokio::test]
async fn test_register_adapter_probes_and_rejects_duplicates() {
    let registry = registry(RegistryConfig::default());

    let offline = ScriptedAdapter::new("sliver");
    offline.set_reachable(false);
    let err = registry.register_adapter(offline).await.unwrap_err();
    assert!(matches!(err, RegistryError::Backend(BackendError::BackendUnavailable(_))));
    assert!(registry.backends().is_empty());

    tokio_test::assert_ok!(registry.register_adapter(ScriptedAdapter::new("sliver")).await);
    let err = registry
        .register_adapter(ScriptedAdapter::new("sliver"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateBackend(name) if name == "sliver"));
    assert_eq!(registry.backends(), vec!["sliver"]);
}

#[tokio::test]
async fn test_successful_command_is_recorded() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = registry_with_sessions(&adapter, &["a1"]).await;
    let seen_before = registry.get_session("sliver_a1").unwrap().last_seen_at;

    adapter.push_command(Ok("uid=0(root)"));
    let reply = registry.execute_command("sliver_a1", "id", None).await;
    assert!(reply.success);
    assert_eq!(reply.output, "uid=0(root)");

    let session = registry.get_session("sliver_a1").unwrap();
    assert_eq!(session.command_history.len(), 1);
    let record = &session.command_history[0];
    assert_eq!(record.command, "id");
    assert!(record.succeeded);
    assert_eq!(record.output_ref.as_deref(), Some("uid=0(root)"));
    assert!(session.last_seen_at >= seen_before);
}

#[tokio::test]
async fn test_failed_command_is_recorded_and_not_retried() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = registry_with_sessions(&adapter, &["a1"]).await;

    adapter.push_command(Err(BackendError::CommandFailed("exit status 1".into())));
    let reply = registry.execute_command("sliver_a1", "false", None).await;
    assert!(!reply.success);
    assert!(reply.output.contains("exit status 1"));
    assert_eq!(adapter.command_count(), 1);

    let history = registry.get_session("sliver_a1").unwrap().command_history;
    assert_eq!(history.len(), 1);
    assert!(!history[0].succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_backend_is_retried() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = registry_with_sessions(&adapter, &["a1"]).await;

    adapter.push_command(Err(BackendError::BackendUnavailable("refused".into())));
    adapter.push_command(Err(BackendError::BackendUnavailable("refused".into())));
    adapter.push_command(Ok("ok"));

    let output = registry.try_execute_command("sliver_a1", "whoami", None).await.unwrap();
    assert_eq!(output, "ok");
    assert_eq!(adapter.command_count(), 3);
    assert_eq!(registry.invoker().backoff("sliver").attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = registry_with_sessions(&adapter, &["a1"]).await;
    for _ in 0..5 {
        adapter.push_command(Err(BackendError::BackendUnavailable("refused".into())));
    }

    let err = registry.try_execute_command("sliver_a1", "whoami", None).await.unwrap_err();
    assert!(matches!(err, RegistryError::Backend(BackendError::BackendUnavailable(_))));
    // One attempt plus the default two retries.
    assert_eq!(adapter.command_count(), 3);
}

#[tokio::test]
async fn test_rate_limited_commands_fail_fast() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = Arc::new(SessionRegistry::new(
        RegistryConfig::default(),
        invoker(RateLimitConfig::new(2, Duration::from_secs(60))),
    ));
    registry.register_adapter_unchecked(adapter.clone()).unwrap();
    adapter.push_listing(&["a1"]);
    PollingScheduler::new(Arc::clone(&registry), SchedulerConfig::default())
        .poll_once()
        .await;

    assert!(registry.execute_command("sliver_a1", "id", None).await.success);
    assert!(registry.execute_command("sliver_a1", "id", None).await.success);

    let err = registry.try_execute_command("sliver_a1", "id", None).await.unwrap_err();
    assert!(matches!(err, RegistryError::RateLimitExceeded { ref resource, .. } if resource == "sliver"));
    assert_eq!(adapter.command_count(), 2);

    let reply = registry.execute_command("sliver_a1", "id", None).await;
    assert!(!reply.success);
    assert!(reply.output.contains("rate limit"));

    // Refusals are recorded even though the backend was never called.
    let history = registry.get_session("sliver_a1").unwrap().command_history;
    assert_eq!(history.len(), 4);
    assert!(history[..2].iter().all(|r| r.succeeded));
    assert!(history[2..].iter().all(|r| !r.succeeded));
    assert!(history[3].output_ref.as_deref().unwrap().starts_with("rate limit exceeded for sliver"));
}

#[tokio::test]
async fn test_unknown_session_reply() {
    let registry = registry(RegistryConfig::default());
    let reply = registry.execute_command("sliver_nope", "id", None).await;
    assert!(!reply.success);
    assert_eq!(reply.output, SESSION_NOT_FOUND);
    assert!(!registry.open_shell("sliver_nope").await);
}

#[tokio::test]
async fn test_open_shell_reaches_adapter() {
    let adapter = ScriptedAdapter::new("metasploit");
    let registry = registry_with_sessions(&adapter, &["4"]).await;

    assert!(registry.open_shell("metasploit_4").await);
    assert_eq!(adapter.shell_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_snapshots_are_copies() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = registry_with_sessions(&adapter, &["a1"]).await;

    let mut copy = registry.get_session("sliver_a1").unwrap();
    copy.active = false;
    copy.metadata.clear();

    let stored = registry.get_session("sliver_a1").unwrap();
    assert!(stored.active);
    assert_eq!(stored.metadata("os"), Some("linux"));
}

#[tokio::test]
async fn test_stale_backend_warns_once() {
    let bus = TelemetryBus::spawn(BusConfig::default());
    let adapter = ScriptedAdapter::new("sliver");
    let registry = Arc::new(
        registry(RegistryConfig {
            stale_after_failed_polls: 2,
            ..RegistryConfig::default()
        })
        .with_telemetry(&bus),
    );
    registry.register_adapter(adapter.clone()).await.unwrap();
    let scheduler = PollingScheduler::new(Arc::clone(&registry), SchedulerConfig::default());

    adapter.push_listing(&["a1", "a2"]);
    scheduler.poll_once().await;
    for _ in 0..4 {
        adapter.push_listing_failure();
    }

    let first = scheduler.poll_once().await;
    assert_eq!(first.failed, vec!["sliver"]);
    assert!(first.lost.is_empty());
    assert_eq!(registry.get_all_sessions().len(), 2);

    let second = scheduler.poll_once().await;
    assert_eq!(second.lost.len(), 2);
    assert!(registry.get_all_sessions().is_empty());

    scheduler.poll_once().await;
    scheduler.poll_once().await;

    assert!(bus.shutdown(Duration::from_secs(1)).await);
    let records = bus.recent(1000);
    let stale: Vec<_> = records.iter().filter(|r| r.message.contains("is stale")).collect();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].level, TelemetryLevel::Warning);
    assert_eq!(stale[0].source, "registry");
    assert!(records.iter().any(|r| r.message.contains("new session sliver_a1")));
    assert!(records.iter().any(|r| r.message.contains("backend sliver registered")));
}

#[tokio::test]
async fn test_recovered_backend_reactivates_sessions() {
    let bus = TelemetryBus::spawn(BusConfig::default());
    let adapter = ScriptedAdapter::new("sliver");
    let registry = Arc::new(
        registry(RegistryConfig {
            stale_after_failed_polls: 1,
            ..RegistryConfig::default()
        })
        .with_telemetry(&bus),
    );
    registry.register_adapter(adapter.clone()).await.unwrap();
    let scheduler = PollingScheduler::new(Arc::clone(&registry), SchedulerConfig::default());

    adapter.push_listing(&["a1"]);
    scheduler.poll_once().await;
    adapter.push_listing_failure();
    scheduler.poll_once().await;
    assert!(registry.get_all_sessions().is_empty());

    let report = scheduler.poll_once().await;
    assert_eq!(report.reactivated.len(), 1);
    assert!(registry.get_session("sliver_a1").unwrap().active);

    assert!(bus.shutdown(Duration::from_secs(1)).await);
    assert!(bus.recent(100).iter().any(|r| r.message == "backend sliver recovered"));
}

#[tokio::test]
async fn test_removed_backend_sessions_go_inactive() {
    let adapter = ScriptedAdapter::new("sliver");
    let registry = registry_with_sessions(&adapter, &["a1"]).await;
    assert!(registry.remove_adapter("sliver").is_some());

    let report = PollingScheduler::new(Arc::clone(&registry), SchedulerConfig::default())
        .poll_once()
        .await;
    assert_eq!(report.lost.len(), 1);
    assert!(registry.get_all_sessions().is_empty());
    assert_eq!(registry.all_sessions().len(), 1);

    let reply = registry.execute_command("sliver_a1", "id", None).await;
    assert!(!reply.success);
    assert!(reply.output.contains("not registered"));
    assert_eq!(registry.get_session("sliver_a1").unwrap().command_history.len(), 1);
}
