mod common;

use std::{sync::Arc, time::Duration};

use common::{ScriptedAdapter, registry};
use opsdeck_core::{BusConfig, TelemetryBus};
use opsdeck_session::{PollingScheduler, RegistryConfig, SchedulerConfig, SchedulerState};

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(50),
        list_timeout: Duration::from_secs(1),
        stop_timeout: Duration::from_millis(500),
    }
}

#[tokio::test(start_paused = true)]
async fn test_loop_polls_until_stopped() {
    let bus = TelemetryBus::spawn(BusConfig::default());
    let adapter = ScriptedAdapter::new("sliver");
    adapter.push_listing(&["a1", "a2"]);
    let registry = Arc::new(registry(RegistryConfig::default()));
    registry.register_adapter_unchecked(adapter.clone()).unwrap();

    let scheduler = PollingScheduler::new(Arc::clone(&registry), fast_config()).with_telemetry(&bus);
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(175)).await;

    assert!(adapter.list_count() >= 3);
    assert_eq!(registry.get_all_sessions().len(), 2);

    assert!(scheduler.stop().await);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    let polls = adapter.list_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(adapter.list_count(), polls);

    assert!(bus.shutdown(Duration::from_secs(1)).await);
    let messages: Vec<String> = bus.recent(100).into_iter().map(|r| r.message).collect();
    assert!(messages.iter().any(|m| m == "session polling started"));
    assert!(messages.iter().any(|m| m == "session polling stopped"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_identical_polls_are_idempotent() {
    let adapter = ScriptedAdapter::new("sliver");
    adapter.push_listing(&["a1"]);
    let registry = Arc::new(registry(RegistryConfig::default()));
    registry.register_adapter_unchecked(adapter.clone()).unwrap();
    let scheduler = PollingScheduler::new(Arc::clone(&registry), fast_config());

    let first = scheduler.poll_once().await;
    assert_eq!(first.added.len(), 1);
    let created = registry.get_session("sliver_a1").unwrap().created_at;

    for _ in 0..3 {
        let report = scheduler.poll_once().await;
        assert!(report.added.is_empty());
        assert!(report.lost.is_empty());
        assert_eq!(report.observed, 1);
    }
    let session = registry.get_session("sliver_a1").unwrap();
    assert_eq!(session.created_at, created);
    assert_eq!(registry.all_sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disappeared_session_keeps_history() {
    let adapter = ScriptedAdapter::new("sliver");
    adapter.push_listing(&["a1", "a2"]);
    let registry = Arc::new(registry(RegistryConfig::default()));
    registry.register_adapter_unchecked(adapter.clone()).unwrap();
    let scheduler = PollingScheduler::new(Arc::clone(&registry), fast_config());
    scheduler.poll_once().await;

    assert!(registry.execute_command("sliver_a2", "hostname", None).await.success);

    adapter.push_listing(&["a1"]);
    let report = scheduler.poll_once().await;
    assert_eq!(report.lost.len(), 1);
    assert_eq!(report.lost[0].to_string(), "sliver_a2");

    let active: Vec<String> = registry.get_all_sessions().iter().map(|s| s.key.to_string()).collect();
    assert_eq!(active, vec!["sliver_a1"]);

    let gone = registry.get_session("sliver_a2").unwrap();
    assert!(!gone.active);
    assert_eq!(gone.command_history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_backend_does_not_block_others() {
    let slow = ScriptedAdapter::new("metasploit");
    slow.push_listing(&["1"]);
    slow.set_list_delay(Duration::from_secs(30));
    let fast = ScriptedAdapter::new("sliver");
    fast.push_listing(&["a1"]);

    let registry = Arc::new(registry(RegistryConfig::default()));
    registry.register_adapter_unchecked(slow.clone()).unwrap();
    registry.register_adapter_unchecked(fast.clone()).unwrap();
    let scheduler = PollingScheduler::new(Arc::clone(&registry), fast_config());

    let report = scheduler.poll_once().await;
    assert_eq!(report.failed, vec!["metasploit"]);
    assert_eq!(report.added.len(), 1);
    assert!(registry.get_session("sliver_a1").is_some());
    assert!(registry.get_session("metasploit_1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stop_gives_up_on_hung_cycle() {
    let hung = ScriptedAdapter::new("sliver");
    hung.set_list_delay(Duration::from_secs(3600));
    let registry = Arc::new(registry(RegistryConfig::default()));
    registry.register_adapter_unchecked(hung.clone()).unwrap();

    let scheduler = PollingScheduler::new(
        Arc::clone(&registry),
        SchedulerConfig {
            list_timeout: Duration::from_secs(7200),
            stop_timeout: Duration::from_millis(100),
            ..fast_config()
        },
    );
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(hung.list_count(), 1);

    assert!(!scheduler.stop().await);
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}
