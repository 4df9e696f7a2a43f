use crate::error::HealthErrorKind;
use crate::service::HealthStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Tier (or custom check) that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Process,
    Port,
    Http,
    Command,
    None,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Process => "process",
            CheckType::Port => "port",
            CheckType::Http => "http",
            CheckType::Command => "command",
            CheckType::None => "none",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one health check of one service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    pub check_type: CheckType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(with = "duration_millis")]
    pub response_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<HealthErrorKind>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", with = "option_duration_secs")]
    pub uptime: Option<Duration>,
}

impl HealthCheckResult {
    pub fn new(service: impl Into<String>, status: HealthStatus, check_type: CheckType) -> Self {
        Self {
            service_name: service.into(),
            status,
            check_type,
            endpoint: None,
            response_time: Duration::ZERO,
            status_code: None,
            error: None,
            error_kind: None,
            timestamp: Utc::now(),
            details: None,
            port: None,
            pid: None,
            uptime: None,
        }
    }

    pub fn healthy(service: impl Into<String>, check_type: CheckType) -> Self {
        Self::new(service, HealthStatus::Healthy, check_type)
    }

    /// An unhealthy (or unknown, for cancellation) result carrying the error.
    pub fn failed(
        service: impl Into<String>,
        check_type: CheckType,
        kind: HealthErrorKind,
        error: impl Into<String>,
    ) -> Self {
        let status = match kind {
            HealthErrorKind::Cancelled => HealthStatus::Unknown,
            _ => HealthStatus::Unhealthy,
        };
        let mut result = Self::new(service, status, check_type);
        result.error = Some(error.into());
        result.error_kind = Some(kind);
        result
    }

    pub fn unknown(service: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(service, HealthStatus::Unknown, CheckType::Process);
        result.error = Some(reason.into());
        result
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Counts against the circuit breaker.
    pub fn is_failure(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Result of a check over a set of services.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub services: Vec<HealthCheckResult>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(project: impl Into<String>, mut services: Vec<HealthCheckResult>) -> Self {
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Self {
            timestamp: Utc::now(),
            project: project.into(),
            summary: HealthSummary::from_results(&services),
            services,
        }
    }

    pub fn get(&self, service: &str) -> Option<&HealthCheckResult> {
        self.services.iter().find(|r| r.service_name == service)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub overall: HealthStatus,
}

impl HealthSummary {
    /// Overall is the most severe status present (unknown only when nothing
    /// else is).
    pub fn from_results(results: &[HealthCheckResult]) -> Self {
        let mut summary = HealthSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
            if result.status.severity() > summary.overall.severity() {
                summary.overall = result.status;
            }
        }
        summary
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }
}

mod option_duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_u64(d.as_secs()),
            None => serializer.serialize_none(),
        }
    }
}
