use super::{CheckType, HealthCheckResult};
use crate::error::HealthErrorKind;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Run a Docker-style `test` array.
///
/// - `["CMD", "curl", "-f", "http://..."]` runs the program directly
/// - `["CMD-SHELL", "curl -f http://... || exit 1"]` runs through `sh -c`
/// - `["NONE"]` disables the check (always healthy)
/// - any other single string runs through `sh -c`
///
/// Exit status 0 is healthy. A command that outlives `timeout` is killed
/// and reported as a timeout.
pub async fn check_command(
    service: &str,
    test: &[String],
    work_dir: &Path,
    env: &HashMap<String, String>,
    timeout: Duration,
) -> HealthCheckResult {
    let (program, args): (&str, Vec<&str>) = match test {
        [] => {
            return HealthCheckResult::failed(
                service,
                CheckType::Command,
                HealthErrorKind::Other,
                "empty health check command",
            )
        }
        [first, ..] if first == "NONE" => {
            return HealthCheckResult::healthy(service, CheckType::None).with_endpoint("none")
        }
        [first, program, rest @ ..] if first == "CMD" => {
            (program.as_str(), rest.iter().map(String::as_str).collect())
        }
        [first, script, ..] if first == "CMD-SHELL" => ("sh", vec!["-c", script.as_str()]),
        [script] => ("sh", vec!["-c", script.as_str()]),
        other => {
            return HealthCheckResult::failed(
                service,
                CheckType::Command,
                HealthErrorKind::Other,
                format!("unsupported health check test {:?}", other),
            )
        }
    };

    let endpoint = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let started = Instant::now();

    let status = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(&args)
            .current_dir(work_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status(),
    )
    .await;

    let mut result = match status {
        Ok(Ok(status)) if status.success() => HealthCheckResult::healthy(service, CheckType::Command),
        Ok(Ok(status)) => HealthCheckResult::failed(
            service,
            CheckType::Command,
            HealthErrorKind::BadStatus,
            format!("command failed: {}", status),
        ),
        Ok(Err(e)) => HealthCheckResult::failed(
            service,
            CheckType::Command,
            HealthErrorKind::Other,
            format!("command failed to run: {}", e),
        ),
        Err(_) => HealthCheckResult::failed(
            service,
            CheckType::Command,
            HealthErrorKind::Timeout,
            format!("command timed out after {:?}", timeout),
        ),
    };
    result.endpoint = Some(endpoint);
    result.response_time = started.elapsed();
    result
}
