use crate::output::UserOutput;
use devfleet::port::PortManager;
use std::path::Path;

pub fn run_ports(work_dir: &Path, clean: bool, json: bool, out: &dyn UserOutput) -> anyhow::Result<()> {
    let manager = PortManager::for_project(work_dir)?;

    if clean {
        let removed = manager.clean_stale_ports()?;
        if !json {
            out.success(&format!("Removed {} stale port assignment(s)", removed));
        }
    }

    let mut assignments = manager.assignments();
    assignments.sort_by_key(|a| a.port);

    if json {
        out.status(&serde_json::to_string_pretty(&assignments)?);
        return Ok(());
    }

    if assignments.is_empty() {
        out.status("No ports are currently assigned.");
        out.status("Ports are assigned on `devfleet up`.");
        return Ok(());
    }

    out.status("Port Assignments");
    out.status("================");
    for assignment in &assignments {
        out.status(&format!(
            "  {:>5}  {:<24} last used {}",
            assignment.port,
            assignment.service_name,
            assignment.last_used.format("%Y-%m-%d %H:%M")
        ));
    }
    Ok(())
}
