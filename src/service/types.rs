use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle status of a service.
///
/// ```text
/// NotStarted ──► Starting ──► Running ──► Stopping ──► Stopped
///                   │            │  ▲                     │
///                   ▼            ▼  │                     │
///            Failed/Crashed ◄────┘ Restarting             │
///                   │                                     │
///                   └────────────► Starting ◄─────────────┘
/// ```
///
/// Lifecycle is independent of [`HealthStatus`]: a `Running` service can be
/// unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Exited with a non-zero code.
    Failed,
    /// Killed by a signal nobody sent on purpose.
    Crashed,
    /// Transient: a stop followed by a start.
    Restarting,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotStarted => "not-started",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
            Status::Crashed => "crashed",
            Status::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

impl Status {
    /// Check if a status transition is valid according to the state machine.
    ///
    /// ```
    /// use devfleet::service::Status;
    ///
    /// assert!(Status::NotStarted.is_valid_transition(Status::Starting));
    /// assert!(Status::Running.is_valid_transition(Status::Crashed));
    /// assert!(!Status::Stopped.is_valid_transition(Status::Running));
    /// ```
    pub fn is_valid_transition(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (NotStarted | Stopped | Failed | Crashed, Starting) => true,

            (Starting, Running | Failed | Crashed | Stopping) => true,

            (Running, Stopping | Failed | Crashed | Restarting) => true,

            (Restarting, Stopping | Starting | Failed | Crashed) => true,

            (Stopping, Stopped | Failed) => true,

            // Clearing a failure without restarting
            (Failed | Crashed, Stopped | Stopping) => true,

            // Same state is always valid (no-op transition)
            (s1, s2) if *s1 == s2 => true,

            _ => false,
        }
    }

    /// A live process is expected to exist in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Status::Starting | Status::Running | Status::Stopping | Status::Restarting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::NotStarted | Status::Stopped | Status::Failed | Status::Crashed
        )
    }
}

/// Health of a service, decoupled from its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Rank for aggregating several results: unhealthy > degraded > healthy > unknown.
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Parse the `status` field health endpoints commonly return.
    pub fn from_body_status(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "healthy" | "ok" | "up" | "pass" => Some(HealthStatus::Healthy),
            "degraded" | "warning" | "warn" => Some(HealthStatus::Degraded),
            "unhealthy" | "down" | "error" | "fail" => Some(HealthStatus::Unhealthy),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Everything needed to launch one start attempt of a service.
///
/// Derived from a `ServiceSpec` on every start and restart.
#[derive(Debug, Clone)]
pub struct ServiceRuntime {
    pub name: String,
    pub command: String,
    pub work_dir: PathBuf,
    /// Primary port, exported as `PORT`.
    pub port: Option<u16>,
    /// Every resolved port in declaration order.
    pub ports: Vec<u16>,
    pub env: HashMap<String, String>,
}

impl ServiceRuntime {
    pub fn new(name: impl Into<String>, command: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            work_dir,
            port: None,
            ports: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if self.port.is_none() {
            self.port = Some(port);
        }
        self.ports.push(port);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// URL a browser would use for the primary port.
    pub fn url(&self) -> Option<String> {
        self.port.map(|p| format!("http://localhost:{}", p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        use Status::*;
        let path = [NotStarted, Starting, Running, Stopping, Stopped, Starting];
        for pair in path.windows(2) {
            assert!(
                pair[0].is_valid_transition(pair[1]),
                "{} -> {} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_restart_path() {
        use Status::*;
        assert!(Running.is_valid_transition(Restarting));
        assert!(Restarting.is_valid_transition(Stopping));
        assert!(Stopped.is_valid_transition(Starting));
    }

    #[test]
    fn test_invalid_transitions() {
        use Status::*;
        assert!(!NotStarted.is_valid_transition(Running));
        assert!(!Stopped.is_valid_transition(Running));
        assert!(!Stopping.is_valid_transition(Running));
        assert!(!Crashed.is_valid_transition(Running));
    }

    #[test]
    fn test_status_serde_kebab() {
        assert_eq!(
            serde_json::to_string(&Status::NotStarted).unwrap(),
            "\"not-started\""
        );
        assert_eq!(Status::NotStarted.to_string(), "not-started");
    }

    #[test]
    fn test_health_severity_order() {
        assert!(HealthStatus::Unhealthy.severity() > HealthStatus::Degraded.severity());
        assert!(HealthStatus::Degraded.severity() > HealthStatus::Healthy.severity());
        assert!(HealthStatus::Healthy.severity() > HealthStatus::Unknown.severity());
    }

    #[test]
    fn test_body_status_parsing() {
        assert_eq!(HealthStatus::from_body_status("OK"), Some(HealthStatus::Healthy));
        assert_eq!(
            HealthStatus::from_body_status("warning"),
            Some(HealthStatus::Degraded)
        );
        assert_eq!(
            HealthStatus::from_body_status("down"),
            Some(HealthStatus::Unhealthy)
        );
        assert_eq!(HealthStatus::from_body_status("banana"), None);
    }

    #[test]
    fn test_runtime_primary_port() {
        let rt = ServiceRuntime::new("api", "node .", PathBuf::from("/tmp"))
            .with_port(4000)
            .with_port(4001);
        assert_eq!(rt.port, Some(4000));
        assert_eq!(rt.ports, vec![4000, 4001]);
        assert_eq!(rt.url().as_deref(), Some("http://localhost:4000"));
    }
}
