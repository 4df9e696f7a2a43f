//! Port assignment and release for the orchestrator.
//!
//! The [`PortManager`] blocks (it may prompt, kill processes or sleep
//! between retries), so every call goes through `spawn_blocking`. These are
//! free functions over an `Arc<PortManager>` because the closures handed to
//! `spawn_blocking` must own what they touch.

use crate::config::ServiceSpec;
use crate::error::{Error, Result};
use crate::port::{PortManager, PortReservation};
use crate::service::RunnerRegistry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One port a service asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct PortRequest {
    /// Key in the assignment table: the service name for the primary port,
    /// `name:index` for the others.
    pub key: String,
    pub preferred: u16,
    pub explicit: bool,
}

/// Assignment key of the `index`th declared port of `service`.
pub(super) fn assignment_key(service: &str, index: usize) -> String {
    if index == 0 {
        service.to_string()
    } else {
        format!("{}:{}", service, index)
    }
}

/// What `spec` needs from the port manager, primary port first.
///
/// A service that declares no ports gets none. The primary preference
/// follows the runner's resolution chain; the other ports use their
/// declared value or any free port.
pub(super) fn port_requests(
    spec: &ServiceSpec,
    runners: &RunnerRegistry,
    work_dir: &Path,
    env: &HashMap<String, String>,
) -> Vec<PortRequest> {
    if !spec.declares_ports() {
        return Vec::new();
    }

    let (preferred, explicit) = runners.preferred_port(spec, work_dir, env);
    let mut requests = vec![PortRequest {
        key: assignment_key(&spec.name, 0),
        preferred,
        explicit,
    }];
    requests.extend(spec.ports.iter().enumerate().skip(1).map(|(index, port)| {
        PortRequest {
            key: assignment_key(&spec.name, index),
            preferred: port.port().unwrap_or(0),
            explicit: port.is_explicit(),
        }
    }));
    requests
}

/// Assign every request in order. On failure the ports assigned by this
/// call are released again before the error is returned.
pub(super) async fn assign_ports(
    ports: &Arc<PortManager>,
    requests: Vec<PortRequest>,
) -> Result<Vec<u16>> {
    let mut assigned = Vec::with_capacity(requests.len());
    for request in requests {
        let manager = Arc::clone(ports);
        let key = request.key.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            manager.assign_port(&request.key, request.preferred, request.explicit, false)
        })
        .await
        .map_err(|e| Error::State(format!("port assignment task failed: {}", e)))
        .and_then(|r| r);

        match outcome {
            Ok(port) => assigned.push((key, port)),
            Err(e) => {
                let keys: Vec<String> = assigned.into_iter().map(|(k, _)| k).collect();
                release_keys(ports, keys).await;
                return Err(e);
            }
        }
    }
    Ok(assigned.into_iter().map(|(_, port)| port).collect())
}

/// Hold every assigned port of `service` with a placeholder listener.
///
/// Any port taken by another process since its assignment fails the whole
/// call with [`Error::PortConflict`]; reservations made so far are dropped.
pub(super) async fn reserve_ports(
    ports: &Arc<PortManager>,
    service: &str,
    assigned: &[u16],
) -> Result<Vec<PortReservation>> {
    if assigned.is_empty() {
        return Ok(Vec::new());
    }
    let manager = Arc::clone(ports);
    let service = service.to_string();
    let assigned = assigned.to_vec();
    tokio::task::spawn_blocking(move || {
        assigned
            .iter()
            .map(|&port| manager.reserve_port(&service, port))
            .collect::<Result<Vec<_>>>()
    })
    .await
    .map_err(|e| Error::State(format!("port reservation task failed: {}", e)))?
}

/// Drop every assignment belonging to `service`.
pub(super) async fn release_ports(ports: &Arc<PortManager>, service: &str) {
    let prefix = format!("{}:", service);
    let keys: Vec<String> = ports
        .assignments()
        .into_iter()
        .map(|a| a.service_name)
        .filter(|key| key == service || key.starts_with(&prefix))
        .collect();
    release_keys(ports, keys).await;
}

async fn release_keys(ports: &Arc<PortManager>, keys: Vec<String>) {
    if keys.is_empty() {
        return;
    }
    let manager = Arc::clone(ports);
    let released = tokio::task::spawn_blocking(move || {
        for key in &keys {
            if let Err(e) = manager.release(key) {
                tracing::warn!(key = %key, error = %e, "Failed to persist port release");
            }
        }
    })
    .await;
    if let Err(e) = released {
        tracing::warn!(error = %e, "Port release task failed");
    }
}

/// Drop assignments unused for a week.
pub(super) async fn clean_stale(ports: &Arc<PortManager>) {
    let manager = Arc::clone(ports);
    match tokio::task::spawn_blocking(move || manager.clean_stale_ports()).await {
        Ok(Ok(0)) => {}
        Ok(Ok(removed)) => tracing::debug!(removed, "Dropped stale port assignments"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to clean stale port assignments"),
        Err(e) => tracing::warn!(error = %e, "Stale port cleanup task failed"),
    }
}
