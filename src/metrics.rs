//! Health and lifecycle metrics.
//!
//! Everything goes through the `metrics` facade and is a no-op until a
//! recorder is installed. [`install_prometheus_recorder`] installs the
//! Prometheus one and hands back a handle for rendering the exposition text.

use crate::error::{Error, Result};
use crate::healthcheck::{BreakerState, HealthCheckResult};
use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const HEALTH_CHECKS_TOTAL: &str = "devfleet_health_checks_total";
pub const HEALTH_CHECK_DURATION: &str = "devfleet_health_check_duration_seconds";
pub const HEALTH_CHECK_ERRORS: &str = "devfleet_health_check_errors_total";
pub const CIRCUIT_BREAKER_STATE: &str = "devfleet_circuit_breaker_state";
pub const SERVICES_RUNNING: &str = "devfleet_services_running";

/// Install the global Prometheus recorder.
///
/// Fails when another recorder is already installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {}", e)))?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(HEALTH_CHECKS_TOTAL, "Health checks performed, by service and status");
    describe_histogram!(HEALTH_CHECK_DURATION, "Health check latency in seconds");
    describe_counter!(HEALTH_CHECK_ERRORS, "Failed health checks, by service and error kind");
    describe_gauge!(
        CIRCUIT_BREAKER_STATE,
        "Circuit breaker state per service (0 closed, 1 half-open, 2 open)"
    );
    describe_gauge!(SERVICES_RUNNING, "Services currently in the running state");
}

/// Record one finished check, whatever its outcome.
pub fn record_check(result: &HealthCheckResult) {
    let service = result.service_name.clone();
    counter!(
        HEALTH_CHECKS_TOTAL,
        "service" => service.clone(),
        "status" => result.status.to_string()
    )
    .increment(1);
    histogram!(
        HEALTH_CHECK_DURATION,
        "service" => service.clone(),
        "check_type" => result.check_type.as_str()
    )
    .record(result.response_time.as_secs_f64());

    if let Some(kind) = result.error_kind {
        counter!(
            HEALTH_CHECK_ERRORS,
            "service" => service,
            "kind" => kind.as_str()
        )
        .increment(1);
    }
}

pub fn record_breaker_state(service: &str, state: BreakerState) {
    gauge!(CIRCUIT_BREAKER_STATE, "service" => service.to_string()).set(state.gauge_value());
}

pub fn record_services_running(count: usize) {
    gauge!(SERVICES_RUNNING).set(count as f64);
}
