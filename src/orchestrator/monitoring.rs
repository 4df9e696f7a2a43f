//! Background sweep over running services.
//!
//! Every cycle:
//! - reaps exited processes, moving their registry entries to
//!   `stopped`/`failed`/`crashed` and releasing their ports
//! - checks the health of everything still running, which updates the
//!   registry through the [`HealthMonitor`]
//! - publishes a change event for every service whose health differs from
//!   the previous cycle

use super::ports;
use crate::error::{ErrorKind, ServiceError};
use crate::healthcheck::{ChangeDetector, HealthMonitor};
use crate::port::PortManager;
use crate::registry::Registry;
use crate::service::{ProcessSupervisor, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Upper bound of the random delay added to each cycle.
const SWEEP_JITTER_MS: u64 = 500;

/// What the sweep needs from the orchestrator.
pub(super) struct Sweep {
    pub registry: Arc<Registry>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub monitor: Arc<HealthMonitor>,
    pub ports: Arc<PortManager>,
    pub interval: Duration,
}

impl Sweep {
    async fn cycle(&self, detector: &mut ChangeDetector, cancel: &CancellationToken) {
        reap_exits(&self.registry, &self.supervisor, &self.ports).await;

        let running: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|entry| entry.status == Status::Running)
            .map(|entry| entry.name)
            .collect();
        if running.is_empty() {
            return;
        }

        match self.monitor.check(&running, cancel).await {
            Ok(report) => {
                for change in detector.observe(&report) {
                    self.registry.publish_health(change);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Health sweep failed"),
        }
    }
}

/// Reap exited processes and record each exit in the registry.
///
/// Ports of exited services are released: nothing listens on them any more.
pub(super) async fn reap_exits(
    registry: &Registry,
    supervisor: &ProcessSupervisor,
    port_manager: &Arc<PortManager>,
) -> Vec<(String, Status)> {
    let exits = supervisor.poll_exits();
    for (name, status) in &exits {
        record_exit(registry, name, *status);
        ports::release_ports(port_manager, name).await;
    }
    exits
}

fn record_exit(registry: &Registry, name: &str, status: Status) {
    let current = registry.get(name).map(|entry| entry.status);

    // A clean exit still passes through stopping.
    if status == Status::Stopped && current.is_some_and(|s| s.is_active() && s != Status::Stopping) {
        let _ = registry.update_status(name, Status::Stopping);
    }
    if let Err(e) = registry.update_status(name, status) {
        tracing::debug!(service = %name, error = %e, "Exit not recorded");
        return;
    }
    if status != Status::Stopped {
        let message = format!("process {} unexpectedly", status);
        let _ = registry.set_error(
            name,
            Some(ServiceError::new(name, ErrorKind::ProcessSpawn, message)),
        );
    }
}

/// Small random delay so several instances do not sweep in lockstep.
async fn apply_sweep_jitter() {
    use rand::Rng;
    let jitter_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(0..=SWEEP_JITTER_MS)
    };
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
}

/// Run the sweep until `cancel` fires, surviving panics of single cycles.
pub(super) async fn run_sweep(sweep: Sweep, cancel: CancellationToken) {
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;

    let mut interval = tokio::time::interval(sweep.interval.max(Duration::from_millis(100)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut detector = ChangeDetector::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Monitoring sweep shutting down");
                break;
            }
            _ = interval.tick() => {
                apply_sweep_jitter().await;

                let outcome = AssertUnwindSafe(sweep.cycle(&mut detector, &cancel))
                    .catch_unwind()
                    .await;

                if let Err(panic_info) = outcome {
                    let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    tracing::error!(
                        "Monitoring sweep cycle panicked: {}. Continuing monitoring...",
                        panic_msg
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;

    fn registry_with(name: &str) -> Registry {
        let registry = Registry::new("/tmp/proj");
        registry.register(&ServiceSpec::new(name));
        registry
    }

    #[test]
    fn test_clean_exit_of_running_service_is_stopped() {
        let registry = registry_with("job");
        registry.update_status("job", Status::Starting).unwrap();
        registry.update_status("job", Status::Running).unwrap();

        record_exit(&registry, "job", Status::Stopped);

        let entry = registry.get("job").unwrap();
        assert_eq!(entry.status, Status::Stopped);
        assert!(entry.error.is_none());
    }

    #[test]
    fn test_crash_records_error() {
        let registry = registry_with("api");
        registry.update_status("api", Status::Starting).unwrap();
        registry.update_status("api", Status::Running).unwrap();
        registry.set_process("api", 4242, Some(3001)).unwrap();

        record_exit(&registry, "api", Status::Crashed);

        let entry = registry.get("api").unwrap();
        assert_eq!(entry.status, Status::Crashed);
        assert_eq!(entry.pid, None);
        assert_eq!(entry.error.unwrap().kind, ErrorKind::ProcessSpawn);
    }

    #[tokio::test]
    async fn test_reap_exits_releases_ports() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with("once");
        let supervisor = ProcessSupervisor::new();
        let port_manager = Arc::new(PortManager::in_memory(dir.path()));
        port_manager.assign_port("once", 0, false, false).unwrap();

        let runtime = crate::service::ServiceRuntime::new(
            "once",
            "sh -c 'sleep 0.5; exit 3'",
            dir.path().to_path_buf(),
        )
        .with_env(std::env::vars().collect());
        registry.update_status("once", Status::Starting).unwrap();
        supervisor.start_service(&runtime).await.unwrap();
        registry.update_status("once", Status::Running).unwrap();

        let mut exits = Vec::new();
        for _ in 0..40 {
            exits = reap_exits(&registry, &supervisor, &port_manager).await;
            if !exits.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(exits, vec![("once".to_string(), Status::Failed)]);
        assert_eq!(registry.get("once").unwrap().status, Status::Failed);
        assert!(port_manager.get_assignment("once").is_none());
    }
}
