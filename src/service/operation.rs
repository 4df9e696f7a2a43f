use crate::error::{Error, ServiceError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
        })
    }
}

/// At most one start/stop/restart per service at any time.
///
/// A second request while one is running is rejected immediately with
/// [`Error::OperationInProgress`]; nothing is queued.
#[derive(Debug, Clone, Default)]
pub struct OperationTracker {
    active: Arc<Mutex<HashMap<String, OperationKind>>>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self, service: &str, kind: OperationKind) -> Result<OperationGuard, Error> {
        let mut active = self.active.lock();
        if let Some(current) = active.get(service) {
            return Err(Error::OperationInProgress {
                service: service.to_string(),
                operation: current.to_string(),
            });
        }
        active.insert(service.to_string(), kind);
        Ok(OperationGuard {
            service: service.to_string(),
            kind,
            active: self.active.clone(),
        })
    }

    pub fn current(&self, service: &str) -> Option<OperationKind> {
        self.active.lock().get(service).copied()
    }
}

/// Held for the duration of one operation; dropping it frees the service
/// for the next one, also on error and cancellation paths.
#[derive(Debug)]
pub struct OperationGuard {
    service: String,
    kind: OperationKind,
    active: Arc<Mutex<HashMap<String, OperationKind>>>,
}

impl OperationGuard {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.service);
    }
}

/// Outcome of one operation on one service.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub service: String,
    pub operation: OperationKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
    #[serde(with = "crate::config::duration_str")]
    pub duration: Duration,
}

impl OperationResult {
    pub fn from_result<T>(
        service: &str,
        operation: OperationKind,
        started: Instant,
        result: &Result<T, Error>,
    ) -> Self {
        Self {
            service: service.to_string(),
            operation,
            success: result.is_ok(),
            error: result
                .as_ref()
                .err()
                .map(|e| ServiceError::from_error(service, e)),
            duration: started.elapsed(),
        }
    }
}

/// Aggregate of a bulk start/stop/restart.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOperationResult {
    pub operation: OperationKind,
    pub results: Vec<OperationResult>,
    pub success_count: usize,
    pub failure_count: usize,
    #[serde(with = "crate::config::duration_str")]
    pub total_duration: Duration,
}

impl BulkOperationResult {
    pub fn new(operation: OperationKind, mut results: Vec<OperationResult>, total_duration: Duration) -> Self {
        results.sort_by(|a, b| a.service.cmp(&b.service));
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            operation,
            failure_count: results.len() - success_count,
            success_count,
            results,
            total_duration,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(|r| !r.success)
    }
}
