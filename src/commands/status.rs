use super::standalone_monitor;
use crate::output::UserOutput;
use devfleet::{FleetConfig, HealthStatus};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusRow {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    health: HealthStatus,
    uses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Declared services with their persisted port and current health.
pub async fn run_status(config: &FleetConfig, work_dir: &Path, json: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let monitor = standalone_monitor(config, work_dir)?;
    let report = monitor.check(&[], &CancellationToken::new()).await?;

    let rows: Vec<StatusRow> = config
        .services
        .iter()
        .map(|spec| {
            let result = report.get(&spec.name);
            StatusRow {
                name: spec.name.clone(),
                port: result.and_then(|r| r.port),
                health: result.map(|r| r.status).unwrap_or_default(),
                uses: spec.uses.clone(),
                error: result.and_then(|r| r.error.clone()),
            }
        })
        .collect();

    if json {
        out.status(&serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    out.status(&format!("Project: {}", report.project));
    out.blank();
    out.status(&format!("  {:<20} {:>6}  {:<10} USES", "SERVICE", "PORT", "HEALTH"));
    for row in &rows {
        let port = row.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        out.status(&format!(
            "  {:<20} {:>6}  {:<10} {}",
            row.name,
            port,
            row.health.to_string(),
            row.uses.join(", ")
        ));
    }
    out.blank();
    out.status(&format!(
        "{} healthy, {} degraded, {} unhealthy, {} unknown",
        report.summary.healthy, report.summary.degraded, report.summary.unhealthy, report.summary.unknown
    ));
    Ok(())
}
