use super::{CheckType, HealthCheckResult};
use crate::error::{Error, HealthErrorKind, Result};
use crate::service::HealthStatus;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Largest response body read from a health endpoint.
pub const MAX_RESPONSE_BODY_SIZE: usize = 1024 * 1024;

/// Endpoints tried, after the configured default, when a service declares
/// no explicit HTTP check.
pub const COMMON_HEALTH_PATHS: &[&str] = &["/health", "/healthz", "/ready", "/alive", "/ping"];

/// Global shared HTTP client for health checks.
///
/// One connection pool for every checker keeps file descriptor usage flat
/// with many services. Per-request timeouts override the 30s fallback.
static SHARED_HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn shared_client() -> &'static Client {
    SHARED_HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default()
    })
}

/// Reject anything that is not an absolute http(s) URL.
pub fn validate_url(url: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(url)
        .map_err(|e| Error::Config(format!("Invalid healthcheck URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::Config(format!(
            "Invalid healthcheck URL '{}': scheme must be http or https, got '{}'",
            url, scheme
        ))),
    }
}

/// 2xx and 3xx are healthy, 5xx unhealthy, anything else degraded.
pub fn status_from_code(code: u16) -> HealthStatus {
    match code {
        200..=399 => HealthStatus::Healthy,
        500.. => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

/// Raw answer of one GET.
enum Probe {
    Response {
        code: u16,
        body: Vec<u8>,
        elapsed: Duration,
    },
    Failed {
        kind: HealthErrorKind,
        message: String,
        elapsed: Duration,
    },
}

async fn get(url: &str, timeout: Duration) -> Probe {
    let started = Instant::now();
    let response = match shared_client().get(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            let kind = if e.is_timeout() {
                HealthErrorKind::Timeout
            } else if e.is_connect() {
                HealthErrorKind::ConnectionRefused
            } else {
                HealthErrorKind::Other
            };
            return Probe::Failed {
                kind,
                message: format!("connection failed: {}", e),
                elapsed: started.elapsed(),
            };
        }
    };

    let code = response.status().as_u16();
    let body = read_limited(response).await;
    Probe::Response {
        code,
        body,
        elapsed: started.elapsed(),
    }
}

async fn read_limited(mut response: reqwest::Response) -> Vec<u8> {
    let mut body = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        let room = MAX_RESPONSE_BODY_SIZE - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= MAX_RESPONSE_BODY_SIZE {
            break;
        }
    }
    body
}

fn into_result(service: &str, url: &str, code: u16, body: &[u8], elapsed: Duration) -> HealthCheckResult {
    let mut status = status_from_code(code);
    let mut details = None;

    if (200..300).contains(&code) && !body.is_empty() {
        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Some(reported) = json
                .get("status")
                .and_then(|s| s.as_str())
                .and_then(HealthStatus::from_body_status)
            {
                status = reported;
            }
            details = Some(json);
        }
    }

    let mut result = HealthCheckResult::new(service, status, CheckType::Http).with_endpoint(url);
    result.status_code = Some(code);
    result.response_time = elapsed;
    result.details = details;
    if status != HealthStatus::Healthy {
        result.error = Some(format!("HTTP {}", code));
        result.error_kind = Some(HealthErrorKind::BadStatus);
    }
    result
}

/// GET a configured URL. Always yields a result.
pub async fn check_url(service: &str, url: &str, timeout: Duration) -> HealthCheckResult {
    if let Err(e) = validate_url(url) {
        return HealthCheckResult::failed(service, CheckType::Http, HealthErrorKind::Other, e.to_string())
            .with_endpoint(url);
    }
    match get(url, timeout).await {
        Probe::Response { code, body, elapsed } => into_result(service, url, code, &body, elapsed),
        Probe::Failed {
            kind,
            message,
            elapsed,
        } => {
            let mut result = HealthCheckResult::failed(service, CheckType::Http, kind, message)
                .with_endpoint(url);
            result.response_time = elapsed;
            result
        }
    }
}

/// Try `default_endpoint` and then the common paths on `localhost:port`.
///
/// A 404 or a connection error moves on to the next path. `None` when no
/// path answered, so the caller can settle on the port tier.
pub async fn probe_endpoints(
    service: &str,
    port: u16,
    default_endpoint: &str,
    timeout: Duration,
) -> Option<HealthCheckResult> {
    let mut paths = vec![default_endpoint];
    paths.extend(COMMON_HEALTH_PATHS.iter().filter(|p| **p != default_endpoint));

    for path in paths {
        let url = format!("http://localhost:{}{}", port, path);
        match get(&url, timeout).await {
            Probe::Response { code: 404, .. } => continue,
            Probe::Response { code, body, elapsed } => {
                return Some(into_result(service, &url, code, &body, elapsed).with_port(Some(port)));
            }
            Probe::Failed { message, .. } => {
                tracing::trace!(service, url = %url, error = %message, "Health endpoint not answering");
                continue;
            }
        }
    }
    None
}
