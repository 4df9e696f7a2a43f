//! Health monitor behaviour seen from outside the crate: persisted port
//! hints, streaming and change events.

use async_trait::async_trait;
use devfleet::config::{MonitorConfig, ServiceSpec};
use devfleet::healthcheck::{
    CheckTarget, CheckType, HealthCheckResult, HealthEvent, HealthMonitor, HealthProbe, HealthStream,
    StreamOptions,
};
use devfleet::{HealthStatus, Registry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Healthy until switched off.
struct ToggleProbe {
    up: AtomicBool,
}

#[async_trait]
impl HealthProbe for ToggleProbe {
    async fn probe(&self, target: &CheckTarget) -> HealthCheckResult {
        let status = if self.up.load(Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthCheckResult::new(&target.service, status, CheckType::Http)
    }
}

fn uncached() -> MonitorConfig {
    MonitorConfig {
        cache_ttl: Duration::ZERO,
        enable_metrics: false,
        ..Default::default()
    }
}

fn specs(names: &[&str]) -> Vec<ServiceSpec> {
    names.iter().map(|n| ServiceSpec::new(*n)).collect()
}

// ============================================================================
// Standalone checks
// ============================================================================

#[tokio::test]
async fn test_port_hints_drive_checks_without_pids() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let mut config = uncached();
    config.timeout = Duration::from_millis(500);
    let monitor = HealthMonitor::new(config, Arc::new(Registry::new("/proj")), &specs(&["db", "idle"]))
        .with_port_hints(HashMap::from([("db".to_string(), port)]));

    let report = monitor.check(&[], &CancellationToken::new()).await.unwrap();

    let db = report.get("db").unwrap();
    assert_eq!(db.status, HealthStatus::Healthy);
    assert_eq!(db.check_type, CheckType::Port);
    assert_eq!(db.port, Some(port));
    assert_eq!(report.get("idle").unwrap().status, HealthStatus::Unknown);
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.healthy, 1);
    assert_eq!(report.summary.unknown, 1);
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_stream_emits_snapshot_then_change() {
    let probe = Arc::new(ToggleProbe {
        up: AtomicBool::new(true),
    });
    let monitor = Arc::new(
        HealthMonitor::new(uncached(), Arc::new(Registry::new("/proj")), &specs(&["api"]))
            .with_probe(probe.clone()),
    );
    let cancel = CancellationToken::new();
    let mut events = HealthStream::subscribe(
        monitor,
        StreamOptions::default().with_interval(Duration::from_secs(1)),
        cancel.clone(),
    );

    let first = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        HealthEvent::Snapshot(report) => {
            assert_eq!(report.get("api").unwrap().status, HealthStatus::Healthy)
        }
        other => panic!("expected a snapshot first, got {:?}", other),
    }

    probe.up.store(false, Ordering::SeqCst);

    let change = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(HealthEvent::Change {
                    service,
                    old_status,
                    new_status,
                    ..
                }) => return (service, old_status, new_status),
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(
        change,
        ("api".to_string(), HealthStatus::Healthy, HealthStatus::Unhealthy)
    );

    cancel.cancel();
}

/// Healthy, but only after a delay.
struct SlowProbe(Duration);

#[async_trait]
impl HealthProbe for SlowProbe {
    async fn probe(&self, target: &CheckTarget) -> HealthCheckResult {
        tokio::time::sleep(self.0).await;
        HealthCheckResult::new(&target.service, HealthStatus::Healthy, CheckType::Http)
    }
}

#[tokio::test]
async fn test_stream_waits_for_probes_within_monitor_budget() {
    let monitor = Arc::new(
        HealthMonitor::new(uncached(), Arc::new(Registry::new("/proj")), &specs(&["api"]))
            .with_probe(Arc::new(SlowProbe(Duration::from_millis(600)))),
    );
    let cancel = CancellationToken::new();
    let options = StreamOptions {
        check_timeout: Duration::from_millis(200),
        ..StreamOptions::default()
    };
    let mut events = HealthStream::subscribe(monitor, options, cancel.clone());

    let first = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        HealthEvent::Snapshot(report) => {
            assert_eq!(report.get("api").unwrap().status, HealthStatus::Healthy)
        }
        other => panic!("expected a snapshot, got {:?}", other),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_stream_ends_when_cancelled() {
    let probe = Arc::new(ToggleProbe {
        up: AtomicBool::new(true),
    });
    let monitor = Arc::new(
        HealthMonitor::new(uncached(), Arc::new(Registry::new("/proj")), &specs(&["api"]))
            .with_probe(probe),
    );
    let cancel = CancellationToken::new();
    let mut events = HealthStream::subscribe(monitor, StreamOptions::default(), cancel.clone());

    cancel.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(3), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "stream kept running after cancellation");
}
