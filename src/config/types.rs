//! Root configuration structure.

use super::duration::duration_str;
use super::{MonitorConfig, ServiceSpec};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default timeout for a dependency level to turn healthy (2 minutes).
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default budget for stopping everything (30 seconds).
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between SIGTERM and SIGKILL for one service.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Root of `devfleet.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Project name. Defaults to the project directory name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    /// Project context shared by every service.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Project-level env file, relative to the project root.
    #[serde(default = "default_env_file")]
    pub env_file: String,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

fn default_env_file() -> String {
    ".env".to_string()
}

impl FleetConfig {
    pub fn new(services: Vec<ServiceSpec>) -> Self {
        Self {
            services,
            env_file: default_env_file(),
            ..Default::default()
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Structural checks that do not need the dependency graph.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &self.services {
            if spec.name.trim().is_empty() {
                return Err(Error::Config("Service name cannot be empty".to_string()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(Error::Config(format!(
                    "Service '{}' is declared more than once",
                    spec.name
                )));
            }
            for key in spec.env.keys() {
                super::env_loader::validate_env_name(key)?;
            }
        }
        Ok(())
    }
}

/// What to do when a dependency level does not turn healthy in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatePolicy {
    /// Roll back everything started so far and fail the run.
    #[default]
    Abort,
    /// Log a warning and start the next level anyway.
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "duration_str")]
    pub startup_timeout: Duration,

    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,

    /// SIGTERM grace per service before SIGKILL.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,

    pub gate_policy: GatePolicy,

    /// Drop port assignments unused for a week before assigning.
    pub clean_stale_ports: bool,

    /// Interval of the background health sweep.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            gate_policy: GatePolicy::Abort,
            clean_stale_ports: true,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_yaml() {
        let yaml = r#"
name: shop
env:
  REGION: local
services:
  - name: db
    command: postgres -D data
    ports: [5432]
  - name: api
    uses: [db]
    ports: [auto]
orchestrator:
  gate_policy: degraded
  startup_timeout: 30s
"#;
        let config: FleetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.env_file, ".env");
        assert_eq!(config.orchestrator.gate_policy, GatePolicy::Degraded);
        assert_eq!(
            config.orchestrator.startup_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(config.orchestrator.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert!(config.validate().is_ok());
        assert!(config.service("api").is_some());
    }

    #[test]
    fn test_gate_policy_defaults_to_abort() {
        assert_eq!(OrchestratorConfig::default().gate_policy, GatePolicy::Abort);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = FleetConfig::new(vec![ServiceSpec::new("a"), ServiceSpec::new("a")]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
