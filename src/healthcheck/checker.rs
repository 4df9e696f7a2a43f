use super::{check_command, check_url, probe_endpoints, CheckType, HealthCheckResult};
use crate::config::{HealthCheckConfig, HealthCheckKind, DEFAULT_HEALTH_CHECK_TIMEOUT};
use crate::error::HealthErrorKind;
use crate::service::{is_process_alive, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Upper bound on the TCP connect of the port tier.
pub const PORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// What the monitor knows about one service when it checks it.
#[derive(Debug, Clone)]
pub struct CheckTarget {
    pub service: String,
    pub pid: Option<u32>,
    /// Primary port, if one was assigned or hinted.
    pub port: Option<u16>,
    /// A service declared without ports never goes past the process tier.
    pub declares_ports: bool,
    pub health: Option<HealthCheckConfig>,
    pub status: Option<Status>,
    pub start_time: Option<DateTime<Utc>>,
    pub work_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl CheckTarget {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            pid: None,
            port: None,
            declares_ports: false,
            health: None,
            status: None,
            start_time: None,
            work_dir: PathBuf::from("."),
            env: HashMap::new(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self.declares_ports = true;
        self
    }

    pub fn with_health(mut self, health: HealthCheckConfig) -> Self {
        self.health = Some(health);
        self
    }

    fn check_timeout(&self, default: Duration) -> Duration {
        self.health
            .as_ref()
            .and_then(|h| h.timeout)
            .unwrap_or(default)
    }

    fn probe_port(&self) -> Option<u16> {
        self.health.as_ref().and_then(|h| h.port).or(self.port)
    }

    fn uptime(&self) -> Option<Duration> {
        self.start_time
            .and_then(|t| (Utc::now() - t).to_std().ok())
    }
}

/// Performs the actual check of one service.
///
/// The monitor wraps every probe with rate limiting, the circuit breaker,
/// a timeout and cancellation; implementations only look at the service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &CheckTarget) -> HealthCheckResult;
}

/// Process, then port, then HTTP; the first decisive tier wins.
#[derive(Debug, Clone)]
pub struct TieredProbe {
    default_endpoint: String,
    timeout: Duration,
}

impl Default for TieredProbe {
    fn default() -> Self {
        Self::new("/health", DEFAULT_HEALTH_CHECK_TIMEOUT)
    }
}

impl TieredProbe {
    pub fn new(default_endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            default_endpoint: default_endpoint.into(),
            timeout,
        }
    }

    /// `Some` when the process tier alone decides the outcome.
    fn process_tier(&self, target: &CheckTarget) -> Option<HealthCheckResult> {
        let pid = target.pid?;
        if is_process_alive(pid) {
            return None;
        }
        Some(
            HealthCheckResult::failed(
                &target.service,
                CheckType::Process,
                HealthErrorKind::ProcessDead,
                format!("process {} is not running", pid),
            )
            .with_pid(Some(pid)),
        )
    }

    fn process_healthy(&self, target: &CheckTarget) -> HealthCheckResult {
        match target.pid {
            Some(pid) => HealthCheckResult::healthy(&target.service, CheckType::Process)
                .with_pid(Some(pid)),
            None => HealthCheckResult::unknown(&target.service, "no health check method available"),
        }
    }

    async fn port_tier(&self, target: &CheckTarget, port: u16) -> HealthCheckResult {
        let started = Instant::now();
        let addr = format!("127.0.0.1:{}", port);
        let outcome = tokio::time::timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await;

        let mut result = match outcome {
            Ok(Ok(_)) => HealthCheckResult::healthy(&target.service, CheckType::Port),
            Ok(Err(e)) => HealthCheckResult::failed(
                &target.service,
                CheckType::Port,
                HealthErrorKind::ConnectionRefused,
                format!("port {} not accepting connections: {}", port, e),
            ),
            Err(_) => HealthCheckResult::failed(
                &target.service,
                CheckType::Port,
                HealthErrorKind::Timeout,
                format!("connect to port {} timed out", port),
            ),
        };
        result.response_time = started.elapsed();
        result.with_endpoint(addr).with_port(Some(port))
    }

    /// The full tier sequence for services without a custom check kind.
    async fn tiered(&self, target: &CheckTarget, timeout: Duration) -> HealthCheckResult {
        if let Some(dead) = self.process_tier(target) {
            return dead;
        }

        let explicit_url = target.health.as_ref().and_then(|h| h.url.clone());
        let explicit_path = target.health.as_ref().and_then(|h| h.path.clone());

        if !target.declares_ports && explicit_url.is_none() {
            return self.process_healthy(target);
        }

        let Some(port) = target.probe_port() else {
            return match explicit_url {
                Some(url) => check_url(&target.service, &url, timeout).await,
                None => self.process_healthy(target),
            };
        };

        let port_result = self.port_tier(target, port).await;
        if port_result.is_failure() {
            return port_result;
        }

        if let Some(url) = explicit_url {
            return check_url(&target.service, &url, timeout)
                .await
                .with_port(Some(port));
        }
        if let Some(path) = explicit_path {
            let url = format!("http://localhost:{}{}", port, path);
            return check_url(&target.service, &url, timeout)
                .await
                .with_port(Some(port));
        }

        probe_endpoints(&target.service, port, &self.default_endpoint, timeout)
            .await
            .unwrap_or(port_result)
    }
}

#[async_trait]
impl HealthProbe for TieredProbe {
    async fn probe(&self, target: &CheckTarget) -> HealthCheckResult {
        let timeout = target.check_timeout(self.timeout);
        let kind = target
            .health
            .as_ref()
            .map(HealthCheckConfig::effective_kind);

        let result = match kind {
            Some(HealthCheckKind::None) => {
                HealthCheckResult::healthy(&target.service, CheckType::None)
            }
            Some(HealthCheckKind::Command) => match self.process_tier(target) {
                Some(dead) => dead,
                None => {
                    let test = target
                        .health
                        .as_ref()
                        .map(|h| h.test.clone())
                        .unwrap_or_default();
                    check_command(&target.service, &test, &target.work_dir, &target.env, timeout)
                        .await
                }
            },
            Some(HealthCheckKind::Process) => self
                .process_tier(target)
                .unwrap_or_else(|| self.process_healthy(target)),
            Some(HealthCheckKind::Tcp) => match (self.process_tier(target), target.probe_port()) {
                (Some(dead), _) => dead,
                (None, Some(port)) => self.port_tier(target, port).await,
                (None, None) => self.process_healthy(target),
            },
            Some(HealthCheckKind::Http) | None => self.tiered(target, timeout).await,
        };

        let mut result = result;
        if result.pid.is_none() {
            result.pid = target.pid;
        }
        if result.port.is_none() {
            result.port = target.port;
        }
        result.uptime = target.uptime();
        result
    }
}
