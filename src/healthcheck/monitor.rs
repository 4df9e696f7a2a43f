use super::{
    BreakerSnapshot, CheckTarget, CheckType, CircuitBreaker, HealthCheckResult, HealthProbe,
    HealthReport, ReportCache, ServiceRateLimiter, TieredProbe, PORT_CONNECT_TIMEOUT,
};
use crate::config::{MonitorConfig, ServiceSpec};
use crate::error::{Error, HealthErrorKind, Result};
use crate::metrics;
use crate::registry::Registry;
use crate::service::HealthStatus;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Health checks for the services of one project.
///
/// Each check passes, in order, the per-service rate limiter, the
/// per-service circuit breaker and the probe itself (bounded by a timeout
/// and the caller's cancellation token). Health problems never surface as
/// `Err`: they become results with an error kind, recorded on the registry
/// entry and in metrics.
pub struct HealthMonitor {
    config: MonitorConfig,
    project: String,
    registry: Arc<Registry>,
    /// Declaration order.
    names: Vec<String>,
    specs: HashMap<String, ServiceSpec>,
    port_hints: HashMap<String, u16>,
    probe: Arc<dyn HealthProbe>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiter: ServiceRateLimiter,
    cache: ReportCache,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("project", &self.project)
            .field("services", &self.names)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, registry: Arc<Registry>, specs: &[ServiceSpec]) -> Self {
        let project = config
            .project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let probe: Arc<dyn HealthProbe> =
            Arc::new(TieredProbe::new(config.default_endpoint.clone(), config.timeout));

        Self {
            limiter: ServiceRateLimiter::with_burst(
                config.rate_limit,
                config.rate_limit_burst(),
                config.rate_limit_wait,
            ),
            cache: ReportCache::new(config.cache_ttl),
            permits: Arc::new(Semaphore::new(config.max_concurrent_checks.max(1))),
            names: specs.iter().map(|s| s.name.clone()).collect(),
            specs: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            port_hints: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            probe,
            project,
            registry,
            config,
        }
    }

    pub fn with_project_name(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    /// Replace the probe doing the actual checking.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Ports to probe for services the registry knows no port of, such as
    /// persisted assignments when nothing was started by this process.
    pub fn with_port_hints(mut self, hints: HashMap<String, u16>) -> Self {
        self.port_hints = hints;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn service_names(&self) -> &[String] {
        &self.names
    }

    /// Check `filter` (every service when empty).
    ///
    /// A report for the same filter younger than the cache TTL is returned
    /// without checking again. Naming an undeclared service is the only
    /// error.
    pub async fn check(&self, filter: &[String], cancel: &CancellationToken) -> Result<HealthReport> {
        if let Some(unknown) = filter.iter().find(|name| !self.specs.contains_key(*name)) {
            return Err(Error::ServiceNotFound(unknown.clone()));
        }
        if let Some(report) = self.cache.get(filter) {
            tracing::trace!("Serving cached health report");
            return Ok(report);
        }

        let names: Vec<&String> = if filter.is_empty() {
            self.names.iter().collect()
        } else {
            self.names.iter().filter(|n| filter.contains(*n)).collect()
        };

        let checks = names.into_iter().map(|name| {
            let permits = Arc::clone(&self.permits);
            async move {
                let _permit = permits.acquire_owned().await.ok();
                self.check_service(name, cancel).await
            }
        });
        let results = join_all(checks).await;

        for result in &results {
            if self.registry.contains(&result.service_name) {
                if let Err(e) = self.registry.update_health(&result.service_name, result.status) {
                    tracing::debug!(service = %result.service_name, error = %e, "Could not record health");
                }
            }
        }

        let report = HealthReport::new(&self.project, results);
        if !cancel.is_cancelled() {
            self.cache.put(filter, &report);
        }
        Ok(report)
    }

    /// One check of one service, through the rate limiter and the breaker.
    #[tracing::instrument(skip(self, cancel), fields(service.name = %name))]
    pub async fn check_service(&self, name: &str, cancel: &CancellationToken) -> HealthCheckResult {
        let Some(target) = self.target(name) else {
            return HealthCheckResult::unknown(name, "service not declared");
        };
        if let Some(status) = target.status.filter(|s| s.is_terminal()) {
            return HealthCheckResult::unknown(name, format!("service is {}", status));
        }

        if !self.limiter.acquire(name).await {
            let result = HealthCheckResult::failed(
                name,
                CheckType::Process,
                HealthErrorKind::RateLimited,
                "rate limit exceeded",
            );
            self.record(&result);
            return result;
        }

        let breaker = self.config.enable_circuit_breaker.then(|| self.breaker(name));
        let permit = match &breaker {
            Some(breaker) => match breaker.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    let result = HealthCheckResult::failed(
                        name,
                        CheckType::Process,
                        HealthErrorKind::CircuitOpen,
                        "circuit breaker open",
                    );
                    self.record(&result);
                    return result;
                }
            },
            None => None,
        };

        let result = self.run_probe(&target, cancel).await;

        if let Some(permit) = permit {
            match result.status {
                HealthStatus::Unhealthy => permit.failure(),
                HealthStatus::Healthy | HealthStatus::Degraded => permit.success(),
                HealthStatus::Unknown => drop(permit),
            }
        }
        self.record(&result);
        result
    }

    /// One probe of `name` that skips the rate limiter and the breaker.
    ///
    /// Startup gating polls services that are expected to fail for a while;
    /// those failures must not open the circuit.
    pub async fn probe_service(&self, name: &str, cancel: &CancellationToken) -> HealthCheckResult {
        let Some(target) = self.target(name) else {
            return HealthCheckResult::unknown(name, "service not declared");
        };
        let result = self.run_probe(&target, cancel).await;
        self.record(&result);
        result
    }

    /// Longest a single probe of `target` may take.
    fn probe_budget(&self, target_timeout: Option<Duration>) -> Duration {
        target_timeout.unwrap_or(self.config.timeout) + PORT_CONNECT_TIMEOUT
    }

    /// Longest one [`check`](Self::check) may take when no permit has to be
    /// waited for: the rate limiter's wait plus the slowest probe budget.
    pub fn cycle_budget(&self) -> Duration {
        let slowest = self
            .specs
            .values()
            .map(|spec| self.probe_budget(spec.health_config().and_then(|h| h.timeout)))
            .max()
            .unwrap_or_else(|| self.probe_budget(None));
        self.config.rate_limit_wait + slowest
    }

    async fn run_probe(&self, target: &CheckTarget, cancel: &CancellationToken) -> HealthCheckResult {
        let name = target.service.as_str();
        let budget = self.probe_budget(target.health.as_ref().and_then(|h| h.timeout));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(budget, self.probe.probe(target)) => Some(r),
        };

        match outcome {
            None => HealthCheckResult::failed(
                name,
                CheckType::Process,
                HealthErrorKind::Cancelled,
                "check cancelled",
            ),
            Some(Err(_)) => HealthCheckResult::failed(
                name,
                CheckType::Process,
                HealthErrorKind::Timeout,
                format!("health check timed out after {:?}", budget),
            )
            .with_port(target.port)
            .with_pid(target.pid),
            Some(Ok(result)) => result,
        }
    }

    pub fn breaker_state(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers.read().get(name).map(|b| b.snapshot())
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    /// Everything the probe needs to know about `name` right now.
    pub fn target(&self, name: &str) -> Option<CheckTarget> {
        let spec = self.specs.get(name)?;
        let entry = self.registry.get(name);
        let hint = self.port_hints.get(name).copied();
        let project_dir = &self.config.project_dir;

        let port = entry
            .as_ref()
            .and_then(|e| e.port)
            .or(hint)
            .or_else(|| spec.primary_port().and_then(|p| p.port()));

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(port) = port {
            env.insert("PORT".to_string(), port.to_string());
        }

        Some(CheckTarget {
            service: name.to_string(),
            pid: entry.as_ref().and_then(|e| e.pid),
            port,
            declares_ports: spec.declares_ports() || hint.is_some(),
            health: spec.health_config(),
            status: entry.as_ref().map(|e| e.status),
            start_time: entry.as_ref().and_then(|e| e.start_time),
            work_dir: spec.work_dir(project_dir),
            env,
        })
    }

    fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                name,
                self.config.breaker_failures,
                self.config.breaker_timeout,
            ))
        }))
    }

    fn record(&self, result: &HealthCheckResult) {
        if self.config.enable_metrics {
            metrics::record_check(result);
        }
        match (&result.error_kind, &result.error) {
            (Some(kind), Some(error)) => tracing::debug!(
                service = %result.service_name,
                status = %result.status,
                kind = %kind,
                error = %error,
                "Health check failed"
            ),
            _ => tracing::trace!(
                service = %result.service_name,
                status = %result.status,
                "Health check finished"
            ),
        }
    }
}
