use super::Orchestrator;
use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::healthcheck::HealthProbe;
use crate::port::{ConflictResolver, PortManager};
use crate::service::{LogHub, RunnerRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builder for constructing an [`Orchestrator`] with a fluent API.
///
/// Everything except the config has a default: the project directory is
/// the current directory, ports persist under the state directory and
/// explicit port conflicts prompt on a terminal.
///
/// # Example
///
/// ```no_run
/// use devfleet::config::FleetConfig;
/// use devfleet::Orchestrator;
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// # async fn example() -> devfleet::Result<()> {
/// let orchestrator = Orchestrator::builder()
///     .config(FleetConfig::default())
///     .project_dir(PathBuf::from("."))
///     .startup_timeout(Duration::from_secs(30))
///     .build()?;
/// orchestrator.start_all().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<FleetConfig>,
    project_dir: Option<PathBuf>,
    port_manager: Option<PortManager>,
    resolver: Option<Box<dyn ConflictResolver>>,
    probe: Option<Arc<dyn HealthProbe>>,
    runners: Option<RunnerRegistry>,
    log_hub: Option<Arc<LogHub>>,
    startup_timeout: Option<Duration>,
    stop_timeout: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration. Required.
    pub fn config(mut self, config: FleetConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn project_dir(mut self, dir: PathBuf) -> Self {
        self.project_dir = Some(dir);
        self
    }

    /// Use this port manager instead of the persisted one.
    pub fn port_manager(mut self, manager: PortManager) -> Self {
        self.port_manager = Some(manager);
        self
    }

    /// Decide explicit port conflicts with `resolver`.
    pub fn conflict_resolver(mut self, resolver: Box<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Some(runners);
        self
    }

    /// Multiplex process output of every service into `hub`.
    pub fn log_hub(mut self, hub: Arc<LogHub>) -> Self {
        self.log_hub = Some(hub);
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Build the orchestrator.
    ///
    /// The dependency graph is validated before anything else is created,
    /// so a cycle or an undeclared dependency leaves no trace behind.
    pub fn build(self) -> Result<Orchestrator> {
        let mut config = self
            .config
            .ok_or_else(|| Error::Config("Orchestrator requires a config".to_string()))?;
        let project_dir = self.project_dir.unwrap_or_else(|| PathBuf::from("."));

        if let Some(timeout) = self.startup_timeout {
            config.orchestrator.startup_timeout = timeout;
        }
        if let Some(timeout) = self.stop_timeout {
            config.orchestrator.stop_timeout = timeout;
        }

        Orchestrator::assemble(
            config,
            project_dir,
            self.port_manager,
            self.resolver,
            self.probe,
            self.runners.unwrap_or_default(),
            self.log_hub,
        )
    }
}
