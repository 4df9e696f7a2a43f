mod graph;
mod health;
mod ports;
mod status;
mod up;

pub use graph::run_graph;
pub use health::{run_health, HealthArgs};
pub use ports::run_ports;
pub use status::run_status;
pub use up::run_up;

use devfleet::healthcheck::HealthMonitor;
use devfleet::port::PortManager;
use devfleet::{FleetConfig, Registry};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A monitor for commands that did not start the services themselves.
///
/// Such a process knows no PIDs, so checks fall through to the ports
/// persisted by the last `devfleet up`.
pub(crate) fn standalone_monitor(config: &FleetConfig, work_dir: &Path) -> anyhow::Result<HealthMonitor> {
    let hints = persisted_ports(work_dir)?;
    let mut monitor_config = config.monitor.clone();
    monitor_config.project_dir = work_dir.to_path_buf();
    let registry = Arc::new(Registry::new(work_dir));

    let mut monitor = HealthMonitor::new(monitor_config, registry, &config.services).with_port_hints(hints);
    if let Some(name) = &config.name {
        monitor = monitor.with_project_name(name);
    }
    Ok(monitor)
}

/// Primary port of each service, as persisted for this project.
pub(crate) fn persisted_ports(work_dir: &Path) -> anyhow::Result<HashMap<String, u16>> {
    let manager = PortManager::for_project(work_dir)?;
    Ok(manager
        .assignments()
        .into_iter()
        .filter(|a| !a.service_name.contains(':'))
        .map(|a| (a.service_name, a.port))
        .collect())
}
