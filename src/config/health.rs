//! Health monitor settings.

use super::duration::duration_str;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-check timeout (5 seconds).
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for the health monitor.
///
/// ```yaml
/// monitor:
///   default_endpoint: /healthz
///   timeout: 3s
///   breaker_failures: 5
///   breaker_timeout: 60s
///   rate_limit: 10
///   cache_ttl: 2s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Project root. Filled in by the orchestrator, never read from YAML.
    #[serde(skip)]
    pub project_dir: PathBuf,

    /// Endpoint tried first for HTTP checks without an explicit path.
    pub default_endpoint: String,

    /// Upper bound on a single check.
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    pub enable_circuit_breaker: bool,

    /// Consecutive failures that open a service's circuit.
    pub breaker_failures: u32,

    /// How long an open circuit waits before letting one probe through.
    #[serde(with = "duration_str")]
    pub breaker_timeout: Duration,

    /// Checks per second per service. 0 disables rate limiting.
    pub rate_limit: u32,

    /// Longest a check waits for a rate-limiter token before reporting
    /// "rate limited".
    #[serde(with = "duration_str")]
    pub rate_limit_wait: Duration,

    pub enable_metrics: bool,

    /// Lifetime of cached reports. Zero disables the cache.
    #[serde(with = "duration_str")]
    pub cache_ttl: Duration,

    pub max_concurrent_checks: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            default_endpoint: "/health".to_string(),
            timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            enable_circuit_breaker: true,
            breaker_failures: 5,
            breaker_timeout: Duration::from_secs(60),
            rate_limit: 0,
            rate_limit_wait: Duration::from_millis(250),
            enable_metrics: true,
            cache_ttl: Duration::from_secs(5),
            max_concurrent_checks: 10,
        }
    }
}

impl MonitorConfig {
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Default::default()
        }
    }

    /// Burst size of the token bucket.
    pub fn rate_limit_burst(&self) -> u32 {
        self.rate_limit.saturating_mul(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.default_endpoint, "/health");
        assert_eq!(config.breaker_failures, 5);
        assert_eq!(config.breaker_timeout, Duration::from_secs(60));
        assert_eq!(config.rate_limit, 0);
        assert_eq!(config.max_concurrent_checks, 10);
    }

    #[test]
    fn test_monitor_partial_yaml_keeps_defaults() {
        let config: MonitorConfig =
            serde_yaml::from_str("rate_limit: 4\nbreaker_timeout: 10s\n").unwrap();
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.rate_limit_burst(), 8);
        assert_eq!(config.breaker_timeout, Duration::from_secs(10));
        assert_eq!(config.timeout, DEFAULT_HEALTH_CHECK_TIMEOUT);
    }
}
