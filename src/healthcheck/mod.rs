//! Health checking.
//!
//! A check runs the cheapest decisive tier first:
//!
//! ```text
//! process alive? ──no──► unhealthy
//!      │ yes
//! ports declared? ──no──► healthy (process tier)
//!      │ yes
//! TCP connect? ──no──► unhealthy
//!      │ yes
//! HTTP endpoint ──► status from code and body (port tier result when none answers)
//! ```
//!
//! [`HealthMonitor`] wraps every probe with a per-service rate limiter and
//! circuit breaker, caches reports briefly and records metrics.
//! [`HealthStream`] turns it into periodic snapshots, change events and
//! heartbeats for a subscriber.

mod cache;
mod checker;
mod circuit_breaker;
mod command;
mod http;
mod monitor;
mod rate_limiter;
mod stream;
mod types;

pub use cache::ReportCache;
pub use checker::{CheckTarget, HealthProbe, TieredProbe, PORT_CONNECT_TIMEOUT};
pub use circuit_breaker::{BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use command::check_command;
pub use http::{
    check_url, probe_endpoints, status_from_code, validate_url, COMMON_HEALTH_PATHS,
    MAX_RESPONSE_BODY_SIZE,
};
pub use monitor::HealthMonitor;
pub use rate_limiter::ServiceRateLimiter;
pub use stream::{
    clamp_interval, ChangeDetector, HealthEvent, HealthStream, StreamOptions,
    DEFAULT_STREAM_INTERVAL, HEARTBEAT_INTERVAL, MAX_STREAM_INTERVAL, MIN_STREAM_INTERVAL,
    STREAM_CHECK_TIMEOUT,
};
pub use types::{CheckType, HealthCheckResult, HealthReport, HealthSummary};
