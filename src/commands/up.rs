use crate::output::UserOutput;
use devfleet::service::LogStream;
use devfleet::Orchestrator;
use std::collections::HashSet;

/// Subscriber queue for streamed process output.
const LOG_STREAM_CAPACITY: usize = 1024;

/// Start `services` (all when empty), then supervise until Ctrl-C.
///
/// A failed start has already rolled back what it started; the
/// orchestrator is cleaned up either way.
pub async fn run_up(
    orchestrator: &Orchestrator,
    services: &[String],
    logs: &[String],
    quiet: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let log_task = if quiet {
        None
    } else {
        spawn_log_printer(orchestrator, logs)
    };

    let started = if services.is_empty() {
        out.status(&format!("Starting {} ...", orchestrator.project_name()));
        orchestrator.start_all().await
    } else {
        out.status(&format!("Starting {} ...", services.join(", ")));
        orchestrator.start_with_dependencies(services).await
    };

    if let Err(e) = started {
        orchestrator.cleanup().await;
        if let Some(task) = log_task {
            task.abort();
        }
        return Err(e.into());
    }

    out.success("All services started. Press Ctrl-C to stop.");
    for entry in orchestrator.snapshot() {
        if let Some(port) = entry.port {
            out.status(&format!("  {:<20} {:<10} port {}", entry.name, entry.status.to_string(), port));
        } else {
            out.status(&format!("  {:<20} {}", entry.name, entry.status));
        }
    }

    orchestrator.run_until_shutdown().await;
    if let Some(task) = log_task {
        task.abort();
    }
    out.success("Stopped.");
    Ok(())
}

/// Print every captured line as `[service] line`, limited to `only` when
/// it is not empty.
fn spawn_log_printer(orchestrator: &Orchestrator, only: &[String]) -> Option<tokio::task::JoinHandle<()>> {
    let hub = orchestrator.log_hub()?;
    let only: HashSet<String> = only.iter().cloned().collect();
    let mut lines = hub.subscribe_filtered(LOG_STREAM_CAPACITY, move |line| {
        only.is_empty() || only.contains(&line.service)
    });

    Some(tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            match line.stream {
                LogStream::Stdout => println!("[{}] {}", line.service, line.line),
                LogStream::Stderr => eprintln!("[{}] {}", line.service, line.line),
            }
        }
    }))
}
