use super::standalone_monitor;
use crate::output::UserOutput;
use devfleet::healthcheck::{HealthReport, HealthStream, StreamOptions};
use devfleet::FleetConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct HealthArgs {
    pub services: Vec<String>,
    pub stream: bool,
    pub interval: Duration,
    pub metrics: bool,
    pub json: bool,
}

pub async fn run_health(
    config: &FleetConfig,
    work_dir: &Path,
    args: HealthArgs,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let metrics_handle = if args.metrics {
        Some(devfleet::metrics::install_prometheus_recorder()?)
    } else {
        None
    };
    let monitor = Arc::new(standalone_monitor(config, work_dir)?);

    if args.stream {
        return stream_health(monitor, args, out).await;
    }

    let report = monitor.check(&args.services, &CancellationToken::new()).await?;
    if args.json {
        out.status(&serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, out);
    }

    if let Some(handle) = metrics_handle {
        out.blank();
        out.status(&handle.render());
    }
    Ok(())
}

/// Print one JSON event per line until Ctrl-C.
async fn stream_health(
    monitor: Arc<devfleet::healthcheck::HealthMonitor>,
    args: HealthArgs,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    // Fail fast on unknown names instead of streaming warnings.
    if let Some(unknown) = args
        .services
        .iter()
        .find(|name| !monitor.service_names().contains(*name))
    {
        return Err(devfleet::Error::ServiceNotFound(unknown.clone()).into());
    }

    let cancel = CancellationToken::new();
    let options = StreamOptions::default()
        .with_interval(args.interval)
        .with_services(args.services);
    let mut events = HealthStream::subscribe(monitor, options, cancel.clone());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => out.status(&serde_json::to_string(&event)?),
                None => break,
            },
        }
    }
    cancel.cancel();
    Ok(())
}

fn print_report(report: &HealthReport, out: &dyn UserOutput) {
    for result in &report.services {
        let mut line = format!(
            "  {:<20} {:<10} {:<8} {:>6}ms",
            result.service_name,
            result.status.to_string(),
            result.check_type.as_str(),
            result.response_time.as_millis()
        );
        if let Some(error) = &result.error {
            line.push_str(&format!("  {}", error));
        }
        out.status(&line);
    }
    out.blank();
    out.status(&format!("Overall: {}", report.summary.overall));
}
