use super::builder::OrchestratorBuilder;
use super::monitoring::{self, Sweep};
use super::ports;
use crate::broadcast::Subscription;
use crate::config::env_loader::{load_optional_env_file, EnvLayers};
use crate::config::{FleetConfig, GatePolicy};
use crate::dependency::Graph;
use crate::error::{Error, ErrorKind, Result, ServiceError};
use crate::healthcheck::{HealthEvent, HealthMonitor, HealthProbe, HealthReport, HealthStream, StreamOptions};
use crate::port::{ConflictResolver, PortManager, PortReservation};
use crate::registry::{FleetEvent, Registry, RegistryEntry};
use crate::service::{
    port_env_var, HealthStatus, LogHub, OperationGuard, OperationKind, OperationTracker,
    ProcessSupervisor, RunnerRegistry, ServiceRuntime, Status,
};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How often the startup gate re-probes services that are not healthy yet.
pub const GATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long cleanup waits for the monitoring sweep to notice cancellation.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The central coordinator of one project's services.
///
/// The Orchestrator is responsible for:
/// - Starting services level by level in dependency order
/// - Gating every level on a first healthy check
/// - Rolling back a failed start in reverse dependency order
/// - Guarded single-service and bulk start/stop/restart
/// - A background sweep that notices crashed processes and health changes
///
/// # Concurrency Model
///
/// Every method takes `&self`. The registry, the port table and the process
/// table are each guarded on their own; the orchestrator holds no lock of
/// its own across an `.await`. A `CancellationToken` reaches every health
/// check and the startup gate, and [`cleanup`](Self::cleanup) cancels it.
///
/// # Example
///
/// ```no_run
/// use devfleet::config::Parser;
/// use devfleet::Orchestrator;
/// use std::path::PathBuf;
///
/// # async fn example() -> devfleet::Result<()> {
/// let config = Parser::new().load_config("devfleet.yaml")?;
/// let orchestrator = Orchestrator::new(config, PathBuf::from("."))?;
/// orchestrator.start_all().await?;
/// orchestrator.run_until_shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    pub(super) config: FleetConfig,
    pub(super) project_dir: PathBuf,
    pub(super) project_name: String,
    pub(super) graph: Graph,
    pub(super) registry: Arc<Registry>,
    pub(super) ports: Arc<PortManager>,
    pub(super) supervisor: Arc<ProcessSupervisor>,
    pub(super) monitor: Arc<HealthMonitor>,
    pub(super) runners: RunnerRegistry,
    pub(super) operations: OperationTracker,
    cancellation_token: CancellationToken,
    monitoring_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stale_ports_cleaned: AtomicBool,
    cleanup_started: AtomicBool,
}

impl Orchestrator {
    /// Orchestrator with persisted ports and the default runners.
    ///
    /// Fails with [`Error::CircularDependency`] or
    /// [`Error::UnknownDependency`] before any port or process is touched.
    pub fn new(config: FleetConfig, project_dir: PathBuf) -> Result<Self> {
        Self::builder().config(config).project_dir(project_dir).build()
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(super) fn assemble(
        config: FleetConfig,
        project_dir: PathBuf,
        port_manager: Option<PortManager>,
        resolver: Option<Box<dyn ConflictResolver>>,
        probe: Option<Arc<dyn HealthProbe>>,
        runners: RunnerRegistry,
        log_hub: Option<Arc<LogHub>>,
    ) -> Result<Self> {
        config.validate()?;
        let graph = Graph::build(&config.services)?;

        let project_name = config
            .name
            .clone()
            .or_else(|| {
                project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "project".to_string());

        let mut port_manager = match port_manager {
            Some(manager) => manager,
            None => PortManager::for_project(&project_dir)?,
        };
        if let Some(resolver) = resolver {
            port_manager = port_manager.with_resolver(resolver);
        }

        let registry = Arc::new(Registry::new(&project_dir));
        for spec in &config.services {
            registry.register(spec);
        }

        let mut monitor_config = config.monitor.clone();
        monitor_config.project_dir = project_dir.clone();
        let mut monitor = HealthMonitor::new(monitor_config, Arc::clone(&registry), &config.services)
            .with_project_name(&project_name);
        if let Some(probe) = probe {
            monitor = monitor.with_probe(probe);
        }

        let supervisor = match log_hub {
            Some(hub) => ProcessSupervisor::with_log_hub(hub),
            None => ProcessSupervisor::new(),
        };

        tracing::debug!(
            project = %project_name,
            services = config.services.len(),
            levels = graph.levels().len(),
            "Orchestrator created"
        );

        Ok(Self {
            config,
            project_dir,
            project_name,
            graph,
            registry,
            ports: Arc::new(port_manager),
            supervisor: Arc::new(supervisor),
            monitor: Arc::new(monitor),
            runners,
            operations: OperationTracker::new(),
            cancellation_token: CancellationToken::new(),
            monitoring_task: tokio::sync::Mutex::new(None),
            stale_ports_cleaned: AtomicBool::new(false),
            cleanup_started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn port_manager(&self) -> &Arc<PortManager> {
        &self.ports
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn log_hub(&self) -> Option<&Arc<LogHub>> {
        self.supervisor.log_hub()
    }

    /// Current state of every service, sorted by name.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.registry.snapshot()
    }

    /// Registry changes and health change events.
    pub fn subscribe(&self, capacity: usize) -> Subscription<FleetEvent> {
        self.registry.subscribe(capacity)
    }

    /// Check health now (cached within the monitor's TTL).
    pub async fn check_health(&self, services: &[String]) -> Result<HealthReport> {
        self.monitor.check(services, &self.cancellation_token).await
    }

    /// A dedicated health stream. It ends when the subscription is dropped
    /// or the orchestrator shuts down.
    pub fn health_stream(&self, options: StreamOptions) -> Subscription<HealthEvent> {
        HealthStream::subscribe(
            Arc::clone(&self.monitor),
            options,
            self.cancellation_token.child_token(),
        )
    }

    /// Start every service, level by level.
    ///
    /// Within a level ports are assigned one service at a time and the
    /// processes are spawned concurrently; the next level begins only once
    /// every service of this one passed its health gate. Any failure stops
    /// everything started by this call in reverse order and is returned.
    pub async fn start_all(&self) -> Result<()> {
        let levels = self.graph.levels();
        self.start_levels(levels).await
    }

    /// Start `targets` and everything they use, with the same level
    /// semantics and rollback as [`start_all`](Self::start_all).
    pub async fn start_with_dependencies(&self, targets: &[String]) -> Result<()> {
        let levels = self.graph.levels_for(targets)?;
        self.start_levels(levels).await
    }

    async fn start_levels(&self, levels: Vec<Vec<String>>) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(self.project_name.clone()));
        }
        self.clean_stale_ports_once().await;

        let mut started = Vec::new();
        for (index, level) in levels.iter().enumerate() {
            let pending: Vec<String> = level
                .iter()
                .filter(|name| !self.is_running(name))
                .cloned()
                .collect();
            if pending.is_empty() {
                continue;
            }
            tracing::info!(level = index, services = ?pending, "Starting level");

            let guards = match self.begin_all(&pending, OperationKind::Start) {
                Ok(guards) => guards,
                Err(e) => {
                    self.rollback(&started).await;
                    return Err(e);
                }
            };
            let result = self.start_group(&pending, &mut started).await;
            drop(guards);

            if let Err(e) = result {
                tracing::error!(level = index, error = %e, "Level failed to start");
                self.rollback(&started).await;
                return Err(e);
            }
        }

        tracing::info!(started = started.len(), "All levels started");
        self.start_monitoring().await;
        Ok(())
    }

    fn begin_all(&self, names: &[String], kind: OperationKind) -> Result<Vec<OperationGuard>> {
        names
            .iter()
            .map(|name| self.operations.try_begin(name, kind))
            .collect()
    }

    /// Prepare, spawn and gate `names` as one group. Every spawned service
    /// is appended to `started`, also when the group fails afterwards.
    pub(super) async fn start_group(&self, names: &[String], started: &mut Vec<String>) -> Result<()> {
        let mut runtimes = Vec::with_capacity(names.len());
        for name in names {
            match self.prepare_runtime(name).await {
                Ok(runtime) => runtimes.push(runtime),
                Err(e) => {
                    self.mark_failed(name, &e);
                    for runtime in &runtimes {
                        ports::release_ports(&self.ports, &runtime.name).await;
                    }
                    return Err(e);
                }
            }
        }

        let results = join_all(runtimes.iter().map(|runtime| self.launch(runtime))).await;
        let mut first_error = None;
        for (runtime, result) in runtimes.iter().zip(results) {
            match result {
                Ok(()) => started.push(runtime.name.clone()),
                Err(e) => {
                    ports::release_ports(&self.ports, &runtime.name).await;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.await_healthy(names).await
    }

    /// Resolve command, environment and ports for one start attempt.
    async fn prepare_runtime(&self, name: &str) -> Result<ServiceRuntime> {
        let spec = self
            .config
            .service(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        let work_dir = spec.work_dir(&self.project_dir);

        let env_file = spec.env_file.as_deref().unwrap_or(&self.config.env_file);
        let dotenv = load_optional_env_file(&self.project_dir, env_file)?;
        let mut env = EnvLayers::from_os()
            .with_project(self.config.env.clone())
            .with_dotenv(dotenv)
            .with_service(spec.env.clone())
            .merge();

        let command = self.runners.command_for(spec, &work_dir).ok_or_else(|| {
            Error::Config(format!(
                "Service '{}' has no command and none could be detected in {}",
                name,
                work_dir.display()
            ))
        })?;

        let requests = ports::port_requests(spec, &self.runners, &work_dir, &env);
        let assigned = ports::assign_ports(&self.ports, requests).await?;

        if let Some(&primary) = assigned.first() {
            env.insert(port_env_var(name), primary.to_string());
        }
        for dependency in self.graph.get_direct_dependencies(name) {
            if let Some(port) = self.registry.get(&dependency).and_then(|e| e.port) {
                env.entry(port_env_var(&dependency))
                    .or_insert_with(|| port.to_string());
            }
        }

        let mut runtime = ServiceRuntime::new(name, command, work_dir).with_env(env);
        for port in assigned {
            runtime = runtime.with_port(port);
        }
        Ok(runtime)
    }

    async fn launch(&self, runtime: &ServiceRuntime) -> Result<()> {
        let name = runtime.name.as_str();
        self.registry.update_status(name, Status::Starting)?;
        self.registry.set_port(name, runtime.port)?;

        // A port taken since assignment fails here, not inside the service.
        let mut reservations = match ports::reserve_ports(&self.ports, name, &runtime.ports).await {
            Ok(reservations) => reservations,
            Err(e) => {
                self.mark_failed(name, &e);
                return Err(e);
            }
        };
        reservations.iter_mut().for_each(PortReservation::release);

        let pid = match self.supervisor.start_service(runtime).await {
            Ok(pid) => pid,
            Err(e) => {
                self.mark_failed(name, &e);
                return Err(e);
            }
        };
        self.registry.set_process(name, pid, runtime.port)?;
        self.registry.update_status(name, Status::Running)?;

        if !self.supervisor.is_running(name) {
            tracing::info!(service = %name, "Process finished during startup");
            self.registry.update_status(name, Status::Stopping)?;
            self.registry.update_status(name, Status::Stopped)?;
        }
        Ok(())
    }

    /// Poll `names` until each is healthy (or degraded), its process
    /// finished cleanly, or the startup timeout passes.
    ///
    /// A process dying with a failure status fails the gate at once. A
    /// timeout fails it under [`GatePolicy::Abort`] and only warns under
    /// [`GatePolicy::Degraded`].
    async fn await_healthy(&self, names: &[String]) -> Result<()> {
        let timeout = self.config.orchestrator.startup_timeout;
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<String> = names.to_vec();

        loop {
            monitoring::reap_exits(&self.registry, &self.supervisor, &self.ports).await;

            // The background sweep may have reaped a gated process first;
            // the supervisor keeps its exit status either way.
            let mut alive = Vec::with_capacity(pending.len());
            for name in pending {
                if self.supervisor.is_running(&name) {
                    alive.push(name);
                    continue;
                }
                match self.supervisor.exit_status(&name) {
                    Some(status) if status != Status::Stopped => {
                        return Err(Error::ProcessSpawn {
                            reason: format!("process {} before turning healthy", status),
                            service: name,
                        });
                    }
                    _ => tracing::debug!(service = %name, "Process finished during health gate"),
                }
            }
            pending = alive;

            let results = join_all(
                pending
                    .iter()
                    .map(|name| self.monitor.probe_service(name, &self.cancellation_token)),
            )
            .await;
            let mut waiting = Vec::with_capacity(pending.len());
            for (name, result) in pending.into_iter().zip(results) {
                if matches!(result.status, HealthStatus::Healthy | HealthStatus::Degraded) {
                    if let Err(e) = self.registry.update_health(&name, result.status) {
                        tracing::debug!(service = %name, error = %e, "Could not record health");
                    }
                } else {
                    waiting.push(name);
                }
            }
            pending = waiting;

            if pending.is_empty() {
                return Ok(());
            }
            if self.is_cancelled() {
                return Err(Error::Cancelled(pending.join(", ")));
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {}
                _ = tokio::time::sleep(GATE_POLL_INTERVAL) => {}
            }
        }

        match self.config.orchestrator.gate_policy {
            GatePolicy::Abort => {
                for name in &pending {
                    let message = format!("not healthy within {:?}", timeout);
                    let _ = self
                        .registry
                        .set_error(name, Some(ServiceError::new(name, ErrorKind::Timeout, message)));
                }
                Err(Error::Timeout(pending.join(", ")))
            }
            GatePolicy::Degraded => {
                tracing::warn!(
                    services = ?pending,
                    timeout = ?timeout,
                    "Services not healthy within the startup timeout, continuing degraded"
                );
                Ok(())
            }
        }
    }

    /// Stop `started` in reverse order and release their ports.
    pub(super) async fn rollback(&self, started: &[String]) {
        if started.is_empty() {
            return;
        }
        tracing::warn!(services = ?started, "Rolling back started services");
        for name in started.iter().rev() {
            if let Err(e) = self.stop_one(name, true).await {
                tracing::warn!(service = %name, error = %e, "Failed to stop service during rollback");
            }
        }
    }

    /// Stop one service without taking its operation guard.
    ///
    /// A service that already exited keeps its `failed`/`crashed` status.
    pub(super) async fn stop_one(&self, name: &str, release_ports: bool) -> Result<()> {
        let entry = self.registry.get(name);
        let was_active = entry.as_ref().is_some_and(|e| e.status.is_active());
        if was_active {
            let _ = self.registry.update_status(name, Status::Stopping);
        }
        let port = entry.and_then(|e| e.port);

        let result = self
            .supervisor
            .stop_service_graceful(name, port, self.config.orchestrator.grace_period)
            .await;

        match &result {
            Ok(()) if was_active => {
                let _ = self.registry.update_status(name, Status::Stopped);
            }
            Ok(()) => {}
            Err(e) => {
                self.mark_failed(name, e);
            }
        }
        if release_ports {
            ports::release_ports(&self.ports, name).await;
        }
        self.monitor.invalidate_cache();
        result
    }

    /// Record `err` against `name` and move it to `Failed` the way the
    /// lifecycle allows from its current state.
    pub(super) fn mark_failed(&self, name: &str, err: &Error) {
        if let Some(entry) = self.registry.get(name) {
            if entry.status.is_terminal() && entry.status != Status::Failed {
                let _ = self.registry.update_status(name, Status::Starting);
            }
        }
        let _ = self.registry.update_status(name, Status::Failed);
        let _ = self
            .registry
            .set_error(name, Some(ServiceError::from_error(name, err)));
    }

    /// True while the service has a live process.
    pub fn is_running(&self, name: &str) -> bool {
        self.supervisor.is_running(name)
    }

    async fn clean_stale_ports_once(&self) {
        if self.config.orchestrator.clean_stale_ports
            && !self.stale_ports_cleaned.swap(true, Ordering::SeqCst)
        {
            ports::clean_stale(&self.ports).await;
        }
    }

    /// Start the background sweep if it is not running yet.
    pub(super) async fn start_monitoring(&self) {
        let mut task = self.monitoring_task.lock().await;
        if task.is_some() || self.is_cancelled() {
            return;
        }
        let sweep = Sweep {
            registry: Arc::clone(&self.registry),
            supervisor: Arc::clone(&self.supervisor),
            monitor: Arc::clone(&self.monitor),
            ports: Arc::clone(&self.ports),
            interval: self.config.orchestrator.sweep_interval,
        };
        *task = Some(tokio::spawn(monitoring::run_sweep(
            sweep,
            self.cancellation_token.child_token(),
        )));
    }

    /// Cancel every in-flight check and gate.
    pub fn cancel_operations(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Wait for Ctrl-C (or [`cancel_operations`](Self::cancel_operations)),
    /// then shut everything down.
    pub async fn run_until_shutdown(&self) {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("Received interrupt, shutting down"),
                Err(e) => tracing::warn!(error = %e, "Failed to listen for interrupt, shutting down"),
            },
            _ = self.cancellation_token.cancelled() => {
                tracing::debug!("Cancelled, shutting down");
            }
        }
        self.cleanup().await;
    }

    /// Orderly shutdown: cancel checks, stop the sweep, stop every running
    /// service level by level in reverse dependency order.
    ///
    /// Port assignments are kept so the next run gets the same ports.
    /// Runs once; later calls return immediately.
    pub async fn cleanup(&self) {
        if self
            .cleanup_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Cleanup already in progress or completed, skipping");
            return;
        }

        tracing::debug!("Cleanup: cancelling in-flight operations");
        self.cancellation_token.cancel();

        let handle = self.monitoring_task.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(MONITOR_JOIN_TIMEOUT, handle).await {
                Ok(_) => tracing::debug!("Cleanup: monitoring sweep finished"),
                Err(_) => tracing::warn!("Cleanup: monitoring sweep join timed out, continuing"),
            }
        }

        let stop_timeout = self.config.orchestrator.stop_timeout;
        let stopping = async {
            for level in self.graph.levels().into_iter().rev() {
                let running: Vec<String> =
                    level.into_iter().filter(|name| self.is_running(name)).collect();
                if running.is_empty() {
                    continue;
                }
                let results = join_all(running.iter().map(|name| self.stop_one(name, false))).await;
                for (name, result) in running.iter().zip(results) {
                    if let Err(e) = result {
                        tracing::warn!(service = %name, error = %e, "Failed to stop service");
                    }
                }
            }
        };
        if tokio::time::timeout(stop_timeout, stopping).await.is_err() {
            tracing::warn!(
                timeout = ?stop_timeout,
                remaining = ?self.supervisor.running_services(),
                "Cleanup: stop timed out, remaining processes are killed on drop"
            );
        }
        tracing::debug!("Cleanup: complete");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        if !self.cleanup_started.load(Ordering::SeqCst) {
            let running = self.supervisor.running_services();
            if !running.is_empty() {
                tracing::warn!(
                    services = ?running,
                    "Orchestrator dropped without cleanup, killing remaining processes"
                );
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project", &self.project_name)
            .field("project_dir", &self.project_dir)
            .field("services", &self.graph.nodes())
            .field("gate_policy", &self.config.orchestrator.gate_policy)
            .field("startup_timeout", &self.config.orchestrator.startup_timeout)
            .field(
                "cleanup_started",
                &self.cleanup_started.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortSpec, ServiceSpec};
    use crate::healthcheck::{CheckTarget, CheckType, HealthCheckResult};

    struct AlwaysHealthy;

    #[async_trait::async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(&self, target: &CheckTarget) -> HealthCheckResult {
            HealthCheckResult::new(&target.service, HealthStatus::Healthy, CheckType::Process)
        }
    }

    fn orchestrator(services: Vec<ServiceSpec>) -> (tempfile::TempDir, Orchestrator) {
        let temp_dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::builder()
            .config(FleetConfig::new(services))
            .project_dir(temp_dir.path().to_path_buf())
            .port_manager(PortManager::in_memory(temp_dir.path()))
            .health_probe(Arc::new(AlwaysHealthy))
            .build()
            .unwrap();
        (temp_dir, orchestrator)
    }

    #[test]
    fn test_cycle_rejected_before_anything_exists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = FleetConfig::new(vec![
            ServiceSpec::new("a").with_command("true").with_uses(&["b"]),
            ServiceSpec::new("b").with_command("true").with_uses(&["a"]),
        ]);
        let err = Orchestrator::builder()
            .config(config)
            .project_dir(temp_dir.path().to_path_buf())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::CircularDependency(_)));
    }

    #[test]
    fn test_project_name_defaults_to_directory() {
        let (dir, orchestrator) = orchestrator(vec![]);
        let expected = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(orchestrator.project_name(), expected);
    }

    #[test]
    fn test_services_registered_up_front() {
        let (_dir, orchestrator) = orchestrator(vec![
            ServiceSpec::new("db").with_command("sleep 30"),
            ServiceSpec::new("api").with_command("sleep 30").with_uses(&["db"]),
        ]);
        let names: Vec<_> = orchestrator.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["api", "db"]);
        assert!(orchestrator
            .snapshot()
            .iter()
            .all(|e| e.status == Status::NotStarted));
    }

    /// Concurrent cleanup calls are safe: one executes, the others skip.
    #[tokio::test]
    async fn test_concurrent_cleanup_guard() {
        let (_dir, orchestrator) = orchestrator(vec![]);
        assert!(!orchestrator.cleanup_started.load(Ordering::SeqCst));

        let orch = Arc::new(orchestrator);
        let (o1, o2, o3) = (Arc::clone(&orch), Arc::clone(&orch), Arc::clone(&orch));
        tokio::join!(o1.cleanup(), o2.cleanup(), o3.cleanup());

        assert!(orch.cleanup_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_runs_once() {
        let (_dir, orchestrator) = orchestrator(vec![]);
        orchestrator.cleanup().await;
        assert!(orchestrator.cleanup_started.load(Ordering::SeqCst));
        orchestrator.cleanup().await;
        assert!(orchestrator.cleanup_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_does_not_hang() {
        let (_dir, orchestrator) = orchestrator(vec![]);
        let result = tokio::time::timeout(Duration::from_secs(10), orchestrator.cleanup()).await;
        assert!(result.is_ok(), "Cleanup should complete within timeout");
    }

    #[tokio::test]
    async fn test_cleanup_cancels_operations() {
        let (_dir, orchestrator) = orchestrator(vec![]);
        assert!(!orchestrator.is_cancelled());
        orchestrator.cleanup().await;
        assert!(orchestrator.is_cancelled());
    }

    #[tokio::test]
    async fn test_start_after_cancel_is_rejected() {
        let (_dir, orchestrator) = orchestrator(vec![ServiceSpec::new("db").with_command("sleep 30")]);
        orchestrator.cancel_operations();
        let err = orchestrator.start_all().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!orchestrator.is_running("db"));
    }

    #[tokio::test]
    async fn test_start_all_and_cleanup_keeps_port_assignments() {
        let (_dir, orchestrator) = orchestrator(vec![ServiceSpec::new("web")
            .with_command("sleep 30")
            .with_port(PortSpec::auto())]);

        orchestrator.start_all().await.unwrap();
        let entry = orchestrator.registry().get("web").unwrap();
        assert_eq!(entry.status, Status::Running);
        // The passing gate result is already on the entry
        assert_eq!(entry.health, HealthStatus::Healthy);
        let port = entry.port.unwrap();

        orchestrator.cleanup().await;
        assert!(!orchestrator.is_running("web"));
        assert_eq!(orchestrator.registry().get("web").unwrap().status, Status::Stopped);
        assert_eq!(
            orchestrator.port_manager().get_assignment("web").map(|a| a.port),
            Some(port)
        );
    }

    #[tokio::test]
    async fn test_port_taken_after_assignment_fails_launch() {
        let (_dir, orchestrator) = orchestrator(vec![ServiceSpec::new("web")
            .with_command("sleep 30")
            .with_port(PortSpec::auto())]);

        let runtime = orchestrator.prepare_runtime("web").await.unwrap();
        let port = runtime.port.unwrap();
        let _intruder = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

        let err = orchestrator.launch(&runtime).await.unwrap_err();

        match err {
            Error::PortConflict { service, port: p, .. } => {
                assert_eq!(service, "web");
                assert_eq!(p, port);
            }
            other => panic!("expected a port conflict, got {:?}", other),
        }
        assert!(!orchestrator.is_running("web"));
        assert_eq!(orchestrator.registry().get("web").unwrap().status, Status::Failed);
    }

    #[tokio::test]
    async fn test_gate_fails_on_exit_reaped_by_sweep() {
        let (_dir, orchestrator) =
            orchestrator(vec![ServiceSpec::new("job").with_command("sh -c 'sleep 0.5; exit 3'")]);
        let runtime = orchestrator.prepare_runtime("job").await.unwrap();
        orchestrator.launch(&runtime).await.unwrap();

        // Reap the way the background sweep does, before the gate looks
        let mut reaped = Vec::new();
        for _ in 0..30 {
            reaped = monitoring::reap_exits(
                &orchestrator.registry,
                &orchestrator.supervisor,
                &orchestrator.ports,
            )
            .await;
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(reaped, vec![("job".to_string(), Status::Failed)]);

        let err = orchestrator
            .await_healthy(&["job".to_string()])
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::ProcessSpawn { ref service, .. } if service == "job"),
            "got {:?}",
            err
        );
    }
}
