//! The externally observable state of every service of one project.
//!
//! One [`Registry`] is built per project and shared by reference. Writes go
//! through a single lock and every change is published as a
//! [`FleetEvent::Registry`] on the project's broadcaster while the lock is
//! held, so observers see the changes of one service in the order they
//! happened.

use crate::broadcast::{Broadcaster, SlowObserverPolicy, Subscription};
use crate::config::ServiceSpec;
use crate::error::{Error, Result, ServiceError};
use crate::healthcheck::HealthEvent;
use crate::metrics;
use crate::service::{HealthStatus, Status};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lifecycle and health of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub name: String,
    pub project_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    pub status: Status,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl RegistryEntry {
    pub fn new(name: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            project_dir: project_dir.into(),
            pid: None,
            port: None,
            url: None,
            language: None,
            framework: None,
            status: Status::NotStarted,
            health: HealthStatus::Unknown,
            start_time: None,
            last_checked: None,
            error: None,
        }
    }

    pub fn from_spec(spec: &ServiceSpec, project_dir: &Path) -> Self {
        let mut entry = Self::new(&spec.name, project_dir);
        entry.language = spec.language.clone();
        entry.framework = spec.framework.clone();
        entry
    }
}

/// Everything observers can subscribe to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum FleetEvent {
    Registry(RegistryEntry),
    Health(HealthEvent),
}

/// Services of one project, keyed by name.
#[derive(Debug)]
pub struct Registry {
    project_dir: PathBuf,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    events: Arc<Broadcaster<FleetEvent>>,
}

impl Registry {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self::with_events(
            project_dir,
            Arc::new(Broadcaster::new(SlowObserverPolicy::Drop)),
        )
    }

    pub fn with_events(project_dir: impl Into<PathBuf>, events: Arc<Broadcaster<FleetEvent>>) -> Self {
        Self {
            project_dir: project_dir.into(),
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn events(&self) -> &Arc<Broadcaster<FleetEvent>> {
        &self.events
    }

    pub fn subscribe(&self, capacity: usize) -> Subscription<FleetEvent> {
        self.events.subscribe(capacity)
    }

    /// Add a `not-started` entry for `spec` unless one exists.
    pub fn register(&self, spec: &ServiceSpec) {
        let mut entries = self.entries.write();
        if entries.contains_key(&spec.name) {
            return;
        }
        let entry = RegistryEntry::from_spec(spec, &self.project_dir);
        self.events.publish(FleetEvent::Registry(entry.clone()));
        entries.insert(spec.name.clone(), entry);
    }

    /// Insert or replace an entry wholesale.
    pub fn upsert(&self, entry: RegistryEntry) {
        let mut entries = self.entries.write();
        self.events.publish(FleetEvent::Registry(entry.clone()));
        entries.insert(entry.name.clone(), entry);
        metrics::record_services_running(Self::count_running(&entries));
    }

    /// Move `name` to `status`. Transitions the lifecycle does not allow
    /// are rejected and leave the entry untouched.
    pub fn update_status(&self, name: &str, status: Status) -> Result<RegistryEntry> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

        if !entry.status.is_valid_transition(status) {
            return Err(Error::State(format!(
                "Invalid status transition for '{}': {} -> {}",
                name, entry.status, status
            )));
        }
        if entry.status == status {
            return Ok(entry.clone());
        }

        tracing::debug!(service = %name, from = %entry.status, to = %status, "Status changed");
        entry.status = status;
        match status {
            Status::Starting => {
                entry.health = HealthStatus::Unknown;
                entry.error = None;
            }
            s if s.is_terminal() => {
                entry.pid = None;
                entry.health = HealthStatus::Unknown;
                if s == Status::Stopped {
                    entry.start_time = None;
                }
            }
            _ => {}
        }

        let snapshot = entry.clone();
        self.events.publish(FleetEvent::Registry(snapshot.clone()));
        metrics::record_services_running(Self::count_running(&entries));
        Ok(snapshot)
    }

    /// Record the process behind a (re)started service.
    pub fn set_process(&self, name: &str, pid: u32, port: Option<u16>) -> Result<()> {
        self.modify(name, |entry| {
            entry.pid = Some(pid);
            entry.port = port;
            entry.url = port.map(|p| format!("http://localhost:{}", p));
            entry.start_time = Some(Utc::now());
        })
    }

    pub fn set_port(&self, name: &str, port: Option<u16>) -> Result<()> {
        self.modify(name, |entry| {
            entry.port = port;
            entry.url = port.map(|p| format!("http://localhost:{}", p));
        })
    }

    pub fn set_error(&self, name: &str, error: Option<ServiceError>) -> Result<()> {
        self.modify(name, |entry| entry.error = error)
    }

    /// Record a health result. Lifecycle status is left alone; observers
    /// only hear about it when the health value changed.
    ///
    /// A service without a process keeps `unknown` health: a result landing
    /// after the service stopped or failed is discarded.
    pub fn update_health(&self, name: &str, health: HealthStatus) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        if entry.status.is_terminal() {
            tracing::trace!(service = %name, status = %entry.status, "Discarding health of inactive service");
            return Ok(());
        }
        entry.last_checked = Some(Utc::now());
        if entry.health != health {
            entry.health = health;
            self.events.publish(FleetEvent::Registry(entry.clone()));
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<RegistryEntry> {
        let mut entries = self.entries.write();
        let removed = entries.remove(name);
        metrics::record_services_running(Self::count_running(&entries));
        removed
    }

    pub fn get(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Every entry, sorted by name.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut all: Vec<RegistryEntry> = self.entries.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn running_count(&self) -> usize {
        Self::count_running(&self.entries.read())
    }

    /// Publish a health event to the same observers as registry changes.
    pub fn publish_health(&self, event: HealthEvent) {
        self.events.publish(FleetEvent::Health(event));
    }

    fn modify(&self, name: &str, f: impl FnOnce(&mut RegistryEntry)) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        f(entry);
        self.events.publish(FleetEvent::Registry(entry.clone()));
        Ok(())
    }

    fn count_running(entries: &HashMap<String, RegistryEntry>) -> usize {
        entries
            .values()
            .filter(|e| e.status == Status::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn registry_with(names: &[&str]) -> Registry {
        let registry = Registry::new("/proj");
        for name in names {
            registry.register(&ServiceSpec::new(*name));
        }
        registry
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry_with(&["api"]);
        registry.update_status("api", Status::Starting).unwrap();
        registry.register(&ServiceSpec::new("api"));
        assert_eq!(registry.get("api").unwrap().status, Status::Starting);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let registry = registry_with(&["api"]);
        registry.update_status("api", Status::Starting).unwrap();
        registry.set_process("api", 4242, Some(4000)).unwrap();
        registry.update_status("api", Status::Running).unwrap();
        registry.update_health("api", HealthStatus::Healthy).unwrap();

        let entry = registry.get("api").unwrap();
        assert_eq!(entry.pid, Some(4242));
        assert_eq!(entry.url.as_deref(), Some("http://localhost:4000"));
        assert_eq!(entry.health, HealthStatus::Healthy);
        assert_eq!(registry.running_count(), 1);

        registry.update_status("api", Status::Stopping).unwrap();
        registry.update_status("api", Status::Stopped).unwrap();
        let entry = registry.get("api").unwrap();
        assert_eq!(entry.pid, None);
        assert_eq!(entry.health, HealthStatus::Unknown);
        assert_eq!(entry.port, Some(4000));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let registry = registry_with(&["api"]);
        let err = registry.update_status("api", Status::Running).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(registry.get("api").unwrap().status, Status::NotStarted);
    }

    #[test]
    fn test_unknown_service() {
        let registry = registry_with(&[]);
        assert!(matches!(
            registry.update_status("ghost", Status::Starting),
            Err(Error::ServiceNotFound(_))
        ));
        assert!(registry.update_health("ghost", HealthStatus::Healthy).is_err());
    }

    #[test]
    fn test_starting_clears_error_and_health() {
        let registry = registry_with(&["api"]);
        registry.update_status("api", Status::Starting).unwrap();
        registry.update_status("api", Status::Failed).unwrap();
        registry
            .set_error(
                "api",
                Some(ServiceError::new("api", ErrorKind::ProcessSpawn, "exit 1")),
            )
            .unwrap();
        assert!(registry.get("api").unwrap().error.is_some());

        registry.update_status("api", Status::Starting).unwrap();
        let entry = registry.get("api").unwrap();
        assert!(entry.error.is_none());
        assert_eq!(entry.health, HealthStatus::Unknown);
    }

    #[test]
    fn test_late_health_of_stopped_service_is_discarded() {
        let registry = registry_with(&["api"]);
        registry.update_status("api", Status::Starting).unwrap();
        registry.update_status("api", Status::Running).unwrap();
        registry.update_status("api", Status::Stopping).unwrap();
        registry.update_status("api", Status::Stopped).unwrap();

        registry.update_health("api", HealthStatus::Healthy).unwrap();

        let entry = registry.get("api").unwrap();
        assert_eq!(entry.health, HealthStatus::Unknown);
        assert!(entry.last_checked.is_none());
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = registry_with(&["web", "api", "db"]);
        let names: Vec<String> = registry.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["api", "db", "web"]);
    }

    #[tokio::test]
    async fn test_changes_are_published_in_order() {
        let registry = registry_with(&["api"]);
        let mut sub = registry.subscribe(16);

        registry.update_status("api", Status::Starting).unwrap();
        registry.update_status("api", Status::Running).unwrap();
        registry.update_health("api", HealthStatus::Healthy).unwrap();
        // Same health again is not an event
        registry.update_health("api", HealthStatus::Healthy).unwrap();

        let mut seen = Vec::new();
        while let Some(FleetEvent::Registry(entry)) = sub.try_recv() {
            seen.push((entry.status, entry.health));
        }
        assert_eq!(
            seen,
            vec![
                (Status::Starting, HealthStatus::Unknown),
                (Status::Running, HealthStatus::Unknown),
                (Status::Running, HealthStatus::Healthy),
            ]
        );
    }
}
