// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Why a single health check did not produce a healthy answer.
///
/// Health errors never abort orchestration; they are recorded on the
/// service's health and retried on the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthErrorKind {
    Timeout,
    ConnectionRefused,
    Cancelled,
    RateLimited,
    CircuitOpen,
    BadStatus,
    ProcessDead,
    Other,
}

impl HealthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthErrorKind::Timeout => "timeout",
            HealthErrorKind::ConnectionRefused => "connection_refused",
            HealthErrorKind::Cancelled => "cancelled",
            HealthErrorKind::RateLimited => "rate_limited",
            HealthErrorKind::CircuitOpen => "circuit_open",
            HealthErrorKind::BadStatus => "bad_status",
            HealthErrorKind::ProcessDead => "process_dead",
            HealthErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for HealthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(devfleet::config::error),
        help("Check your devfleet.yaml for typos and missing fields")
    )]
    Config(String),

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    #[diagnostic(
        code(devfleet::dependency::circular),
        help("Services cannot depend on each other in a cycle. Review the `uses` fields")
    )]
    CircularDependency(Vec<String>),

    #[error("Service '{service}' uses undeclared service '{dependency}'")]
    #[diagnostic(
        code(devfleet::dependency::unknown),
        help("Declare '{dependency}' under `services:` or remove it from the `uses` list of '{service}'")
    )]
    UnknownDependency { service: String, dependency: String },

    #[error("Port {port} required by service '{service}' is in use{}",
        .process_name.as_ref()
            .zip(.pid.as_ref())
            .map(|(name, pid)| format!(" by {} (PID {})", name, pid))
            .unwrap_or_default()
    )]
    #[diagnostic(
        code(devfleet::port::conflict),
        help("Find what's using the port with: lsof -i :{port}\nExplicit ports are never substituted; stop the conflicting process or change the port in your config")
    )]
    PortConflict {
        service: String,
        port: u16,
        pid: Option<u32>,
        process_name: Option<String>,
    },

    #[error("No available ports in range {start}-{end}")]
    #[diagnostic(
        code(devfleet::port::exhausted),
        help("Widen the range with DEVFLEET_PORT_RANGE_START / DEVFLEET_PORT_RANGE_END or stop unused services")
    )]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("Invalid port {port}: {reason}")]
    #[diagnostic(code(devfleet::port::invalid))]
    InvalidPort { port: u32, reason: String },

    #[error("Service '{service}' failed to spawn: {reason}")]
    #[diagnostic(
        code(devfleet::process::spawn),
        help("Check that the command exists and is executable")
    )]
    ProcessSpawn { service: String, reason: String },

    #[error("Service '{service}' failed to stop: {reason}")]
    #[diagnostic(code(devfleet::process::stop))]
    ProcessStop { service: String, reason: String },

    #[error("Health check for '{service}' failed ({kind}): {message}")]
    #[diagnostic(code(devfleet::health::check))]
    HealthCheck {
        service: String,
        kind: HealthErrorKind,
        message: String,
    },

    #[error("Operation already in progress for service '{service}': {operation}")]
    #[diagnostic(
        code(devfleet::service::operation_in_progress),
        help("Wait for the current {operation} of '{service}' to finish and retry")
    )]
    OperationInProgress { service: String, operation: String },

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(devfleet::service::not_found),
        help("Check available services with `devfleet status`")
    )]
    ServiceNotFound(String),

    #[error("Service '{0}' is already running")]
    #[diagnostic(code(devfleet::service::already_running))]
    AlreadyRunning(String),

    #[error("Timeout waiting for service '{0}'")]
    #[diagnostic(
        code(devfleet::service::timeout),
        help("The service may be slow to start. Increase `startup_timeout` or check its output")
    )]
    Timeout(String),

    #[error("Operation cancelled for service '{0}'")]
    Cancelled(String),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),

    #[error("Operation aborted by user")]
    Aborted,

    #[error("State error: {0}")]
    #[diagnostic(code(devfleet::state::error))]
    State(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`] used in user-visible payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    PortConflict,
    ProcessSpawn,
    HealthCheck,
    OperationConflict,
    NotFound,
    Timeout,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::PortConflict => "port_conflict",
            ErrorKind::ProcessSpawn => "process_spawn",
            ErrorKind::HealthCheck => "health_check",
            ErrorKind::OperationConflict => "operation_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The shape failures take when they cross the query and streaming interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    pub service: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(service: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(service: impl Into<String>, err: &Error) -> Self {
        Self::new(service, err.kind(), err.to_string())
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.service, self.kind, self.message)
    }
}

impl Error {
    /// Classify this error for structured output.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::CircularDependency(_)
            | Error::UnknownDependency { .. }
            | Error::InvalidPort { .. }
            | Error::Yaml(_) => ErrorKind::Config,
            Error::PortConflict { .. } | Error::PortRangeExhausted { .. } => {
                ErrorKind::PortConflict
            }
            Error::ProcessSpawn { .. } | Error::ProcessStop { .. } => ErrorKind::ProcessSpawn,
            Error::HealthCheck { .. } => ErrorKind::HealthCheck,
            Error::OperationInProgress { .. } | Error::AlreadyRunning(_) => {
                ErrorKind::OperationConflict
            }
            Error::ServiceNotFound(_) => ErrorKind::NotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) | Error::Aborted => ErrorKind::Cancelled,
            Error::Multiple(errors) => errors
                .first()
                .map(Error::kind)
                .unwrap_or(ErrorKind::Internal),
            Error::State(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Http(_)
            | Error::InvalidPid { .. } => ErrorKind::Internal,
        }
    }

    /// True for errors that must abort an orchestration run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::HealthCheck { .. })
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ServiceNotFound(name) => Some(format!(
                "Check `devfleet status` for known services. '{}' is not declared in this project.",
                name
            )),
            Error::PortConflict {
                port,
                pid,
                process_name,
                ..
            } => {
                let kill_hint = match (pid, process_name) {
                    (Some(p), Some(name)) => format!(
                        "To free the port, stop '{}' (PID {}) or change the explicit port.",
                        name, p
                    ),
                    (Some(p), None) => {
                        format!("To free the port, kill PID {} or change the explicit port.", p)
                    }
                    _ => "Remove `explicit: true` to let devfleet pick a free port.".to_string(),
                };
                Some(format!("Port {} is already in use. {}", port, kill_hint))
            }
            Error::PortRangeExhausted { .. } => Some(
                "Stop services you no longer need, or run `devfleet ports --clean` to drop stale assignments."
                    .to_string(),
            ),
            Error::CircularDependency(path) => Some(format!(
                "Services cannot depend on each other in a cycle. Review the uses fields for: {}",
                path.join(", ")
            )),
            Error::UnknownDependency { dependency, .. } => Some(format!(
                "Add a service named '{}' or fix the spelling in `uses`.",
                dependency
            )),
            Error::OperationInProgress { service, .. } => Some(format!(
                "Another command is already acting on '{}'. Retry once it completes.",
                service
            )),
            Error::Timeout(name) => Some(format!(
                "'{}' did not become healthy in time. Check its output and its healthcheck.",
                name
            )),
            Error::Config(msg) if msg.contains("Could not find") => None,
            Error::Config(_) => Some("Validate your config with: devfleet graph".to_string()),
            Error::ProcessSpawn { .. } => {
                Some("Check that the command exists and is executable".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, service_name: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to operate on PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for service '{}', cannot convert safely",
                pid, service_name
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but without the PID 1 refusal, for read-only checks.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}
