//! Single-service and bulk start/stop/restart.
//!
//! Every command takes the service's operation guard first, so a second
//! command for the same service fails with
//! [`Error::OperationInProgress`] instead of racing the first. Bulk
//! commands report per-service outcomes rather than failing as a whole.

use super::Orchestrator;
use crate::error::{Error, Result};
use crate::service::{BulkOperationResult, OperationKind, OperationResult, Status};
use futures::future::join_all;
use std::collections::HashSet;
use std::time::Instant;

impl Orchestrator {
    fn ensure_known(&self, name: &str) -> Result<()> {
        if self.graph.contains(name) {
            Ok(())
        } else {
            Err(Error::ServiceNotFound(name.to_string()))
        }
    }

    /// Start one service and wait for its health gate.
    ///
    /// Dependencies are not started; one that is not running only earns a
    /// warning. A failed start leaves nothing running and no port assigned.
    #[tracing::instrument(skip(self, name), fields(service.name = %name))]
    pub async fn start_service(&self, name: &str) -> Result<()> {
        self.ensure_known(name)?;
        let _guard = self.operations.try_begin(name, OperationKind::Start)?;
        if self.is_running(name) {
            return Err(Error::AlreadyRunning(name.to_string()));
        }

        for dependency in self.graph.get_direct_dependencies(name) {
            if !self.is_running(&dependency) {
                tracing::warn!(dependency = %dependency, "Dependency is not running");
            }
        }

        let mut started = Vec::new();
        let result = self.start_group(&[name.to_string()], &mut started).await;
        if result.is_err() {
            self.rollback(&started).await;
        }
        result
    }

    /// Stop one service and release its ports.
    ///
    /// Stopping a service without a live process still makes sure nothing
    /// holds its port.
    #[tracing::instrument(skip(self, name), fields(service.name = %name))]
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        self.ensure_known(name)?;
        let _guard = self.operations.try_begin(name, OperationKind::Stop)?;
        self.stop_one(name, true).await
    }

    /// Stop then start one service, keeping its ports.
    #[tracing::instrument(skip(self, name), fields(service.name = %name))]
    pub async fn restart_service(&self, name: &str) -> Result<()> {
        self.ensure_known(name)?;
        let _guard = self.operations.try_begin(name, OperationKind::Restart)?;

        if self.is_running(name) {
            let _ = self.registry.update_status(name, Status::Restarting);
        }
        self.stop_one(name, false).await?;

        let mut started = Vec::new();
        let result = self.start_group(&[name.to_string()], &mut started).await;
        if result.is_err() {
            self.rollback(&started).await;
        }
        result
    }

    /// Start `names` (everything when empty) plus what they use, level by
    /// level, one guarded start per service.
    ///
    /// Unlike [`start_all`](Self::start_all) a failure does not roll back
    /// the others; a service whose dependency failed is not attempted.
    pub async fn start_services(&self, names: &[String]) -> Result<BulkOperationResult> {
        let started_at = Instant::now();
        let levels = if names.is_empty() {
            self.graph.levels()
        } else {
            self.graph.levels_for(names)?
        };

        let mut results = Vec::new();
        let mut failed: HashSet<String> = HashSet::new();
        for level in levels {
            let mut runnable = Vec::new();
            for name in level {
                if self.is_running(&name) {
                    continue;
                }
                let blocked_by = self
                    .graph
                    .get_dependencies(&name)
                    .into_iter()
                    .find(|dep| failed.contains(dep));
                match blocked_by {
                    Some(dependency) => {
                        tracing::warn!(service = %name, dependency = %dependency, "Skipping start, dependency failed");
                        let skipped: Result<()> = Err(Error::Cancelled(name.clone()));
                        results.push(OperationResult::from_result(
                            &name,
                            OperationKind::Start,
                            Instant::now(),
                            &skipped,
                        ));
                        failed.insert(name);
                    }
                    None => runnable.push(name),
                }
            }

            let outcomes = join_all(runnable.iter().map(|name| async move {
                let began = Instant::now();
                let result = self.start_service(name).await;
                OperationResult::from_result(name, OperationKind::Start, began, &result)
            }))
            .await;
            for outcome in outcomes {
                if !outcome.success {
                    failed.insert(outcome.service.clone());
                }
                results.push(outcome);
            }
        }

        if results.iter().any(|r| r.success) {
            self.start_monitoring().await;
        }
        Ok(BulkOperationResult::new(
            OperationKind::Start,
            results,
            started_at.elapsed(),
        ))
    }

    /// Stop every service that is running, dependents before their
    /// dependencies, and release their ports.
    pub async fn stop_all(&self) -> BulkOperationResult {
        let started_at = Instant::now();
        let mut results = Vec::new();

        for level in self.graph.levels().into_iter().rev() {
            let targets: Vec<String> = level
                .into_iter()
                .filter(|name| self.needs_stop(name))
                .collect();
            let outcomes = join_all(targets.iter().map(|name| async move {
                let began = Instant::now();
                let result = self.stop_service(name).await;
                OperationResult::from_result(name, OperationKind::Stop, began, &result)
            }))
            .await;
            results.extend(outcomes);
        }

        BulkOperationResult::new(OperationKind::Stop, results, started_at.elapsed())
    }

    /// Restart every running service concurrently.
    pub async fn restart_all(&self) -> BulkOperationResult {
        let started_at = Instant::now();
        let targets: Vec<String> = self
            .graph
            .nodes()
            .iter()
            .filter(|name| self.is_running(name))
            .cloned()
            .collect();

        let results = join_all(targets.iter().map(|name| async move {
            let began = Instant::now();
            let result = self.restart_service(name).await;
            OperationResult::from_result(name, OperationKind::Restart, began, &result)
        }))
        .await;

        BulkOperationResult::new(OperationKind::Restart, results, started_at.elapsed())
    }

    /// A live process, or a registry entry that still claims one.
    fn needs_stop(&self, name: &str) -> bool {
        self.is_running(name)
            || self
                .registry
                .get(name)
                .is_some_and(|entry| entry.status.is_active())
    }
}
