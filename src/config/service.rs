//! Service definitions.
//!
//! [`ServiceSpec`] is immutable once loaded; every start derives a fresh
//! runtime (command, port, environment) from it.

use super::duration::option_duration_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A single service of the project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    /// Language hint ("node", "python", "go", "rust", "dotnet").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    /// Directory of the service, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<PathBuf>,

    /// Launch command. When absent the runner registry derives one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    #[serde(default, alias = "environment", skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Per-service env file, replacing the project-level one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,

    /// Names of services this one depends on.
    #[serde(default, alias = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub uses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheckSpec>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_uses(mut self, uses: &[&str]) -> Self {
        self.uses = uses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_healthcheck(mut self, healthcheck: HealthCheckSpec) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    /// Absolute working directory of the service.
    pub fn work_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.project {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => project_dir.join(p),
            None => project_dir.to_path_buf(),
        }
    }

    pub fn primary_port(&self) -> Option<&PortSpec> {
        self.ports.first()
    }

    pub fn declares_ports(&self) -> bool {
        !self.ports.is_empty()
    }

    /// Resolved health check, if any was declared.
    pub fn health_config(&self) -> Option<HealthCheckConfig> {
        self.healthcheck.as_ref().map(HealthCheckSpec::resolve)
    }
}

/// A declared port.
///
/// ```yaml
/// ports: [8080]                       # explicit, must be honored exactly
/// ports: ["auto"]                     # any free port
/// ports: [{ port: 3000, explicit: false }]   # preferred, falls back when busy
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Fixed(u16),
    Auto(AutoPort),
    Detailed {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_explicit")]
        explicit: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoPort {
    Auto,
}

fn default_explicit() -> bool {
    true
}

impl PortSpec {
    pub fn explicit(port: u16) -> Self {
        PortSpec::Fixed(port)
    }

    pub fn preferred(port: u16) -> Self {
        PortSpec::Detailed {
            port: Some(port),
            explicit: false,
        }
    }

    pub fn auto() -> Self {
        PortSpec::Auto(AutoPort::Auto)
    }

    /// The configured port number, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            PortSpec::Fixed(p) => Some(*p),
            PortSpec::Auto(_) => None,
            PortSpec::Detailed { port, .. } => *port,
        }
    }

    /// Explicit ports must be honored exactly; no alternate is ever substituted.
    pub fn is_explicit(&self) -> bool {
        match self {
            PortSpec::Fixed(_) => true,
            PortSpec::Auto(_) => false,
            PortSpec::Detailed { port, explicit } => *explicit && port.is_some(),
        }
    }
}

/// Health check declaration.
///
/// ```yaml
/// healthcheck: "/health"                    # HTTP path on the service port
/// healthcheck: "http://localhost:9000/up"   # full URL
/// healthcheck: none                         # disabled, always healthy
/// healthcheck:
///   type: command
///   test: ["CMD-SHELL", "pg_isready"]
///   timeout: 3s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthCheckSpec {
    Shorthand(String),
    Detailed(HealthCheckConfig),
}

impl HealthCheckSpec {
    pub fn http(path: impl Into<String>) -> Self {
        HealthCheckSpec::Shorthand(path.into())
    }

    pub fn resolve(&self) -> HealthCheckConfig {
        match self {
            HealthCheckSpec::Detailed(config) => config.clone(),
            HealthCheckSpec::Shorthand(s) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("none") {
                    HealthCheckConfig {
                        kind: Some(HealthCheckKind::None),
                        ..Default::default()
                    }
                } else if s.starts_with("http://") || s.starts_with("https://") {
                    HealthCheckConfig {
                        kind: Some(HealthCheckKind::Http),
                        url: Some(s.to_string()),
                        ..Default::default()
                    }
                } else if s.starts_with('/') {
                    HealthCheckConfig {
                        kind: Some(HealthCheckKind::Http),
                        path: Some(s.to_string()),
                        ..Default::default()
                    }
                } else {
                    HealthCheckConfig {
                        kind: Some(HealthCheckKind::Command),
                        test: vec!["CMD-SHELL".to_string(), s.to_string()],
                        ..Default::default()
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    Http,
    #[serde(alias = "port")]
    Tcp,
    Process,
    Command,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<HealthCheckKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Port to probe instead of the service's primary port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Docker-style test: `["CMD", "bin", "arg"]`, `["CMD-SHELL", "cmd"]` or `["NONE"]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test: Vec<String>,

    #[serde(
        default,
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    #[serde(
        default,
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,

    #[serde(
        default,
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub start_period: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl HealthCheckConfig {
    /// The effective check kind. An explicit `type` wins; otherwise it is
    /// inferred from which fields are set.
    pub fn effective_kind(&self) -> HealthCheckKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        if self
            .test
            .first()
            .is_some_and(|t| t.eq_ignore_ascii_case("NONE"))
        {
            return HealthCheckKind::None;
        }
        if !self.test.is_empty() {
            return HealthCheckKind::Command;
        }
        if self.url.is_some() || self.path.is_some() {
            return HealthCheckKind::Http;
        }
        if self.port.is_some() {
            return HealthCheckKind::Tcp;
        }
        HealthCheckKind::Process
    }
}
