use crate::error::validate_pid;
use nix::sys::signal::{self, Signal};
use std::collections::HashSet;
use std::process::Command;
use std::time::Duration;

/// A port that is in use, and whoever holds it.
#[derive(Debug, Clone)]
pub struct PortConflict {
    pub port: u16,
    pub processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: Option<String>,
}

impl PortConflict {
    /// Check if a port is in use and return conflict info
    pub fn check(port: u16) -> Option<Self> {
        if is_port_available(port) {
            return None;
        }
        Some(PortConflict {
            port,
            processes: find_processes_on_port(port),
        })
    }

    /// The first holder, used for error reporting.
    pub fn primary(&self) -> Option<&ProcessInfo> {
        self.processes.first()
    }

    /// Signal every holder of the port except this process.
    ///
    /// `force` selects SIGKILL over SIGTERM.
    pub fn kill_all_blocking_processes(&self, force: bool) -> Vec<(u32, Result<(), String>)> {
        let current_pid = std::process::id();
        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let mut results = Vec::new();

        for process in &self.processes {
            if process.pid == current_pid {
                tracing::debug!(
                    port = self.port,
                    "Skipping self (PID {}) when freeing port",
                    process.pid
                );
                continue;
            }

            let result = validate_pid(process.pid, &process.name)
                .map_err(|e| e.to_string())
                .and_then(|pid| {
                    signal::kill(pid, sig)
                        .map_err(|e| format!("Failed to signal PID {}: {}", process.pid, e))
                });
            results.push((process.pid, result));
        }

        results
    }

    /// Kill all holders and wait for the port to become free.
    ///
    /// The first attempt sends SIGTERM, later ones SIGKILL. Newly appeared
    /// holders are picked up between attempts. Blocks the calling thread.
    pub fn kill_and_verify(&self, max_attempts: u32, wait: Duration) -> Result<(), String> {
        let mut current = self.clone();

        for attempt in 1..=max_attempts {
            for (pid, result) in current.kill_all_blocking_processes(attempt > 1) {
                if let Err(e) = result {
                    tracing::debug!(port = self.port, pid, error = %e, "Kill attempt failed");
                }
            }

            std::thread::sleep(wait);

            if is_port_available(self.port) {
                tracing::info!(port = self.port, attempt, "Port freed");
                return Ok(());
            }

            if let Some(refreshed) = PortConflict::check(self.port) {
                current = refreshed;
            }
        }

        Err(format!(
            "Port {} still in use after {} attempts to kill blocking processes",
            self.port, max_attempts
        ))
    }
}

/// True when both loopback and wildcard binds succeed.
///
/// On macOS binding 127.0.0.1 can succeed while 0.0.0.0 is taken, so both are
/// tried.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
        && std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Find every process listening on `port`.
pub fn find_processes_on_port(port: u16) -> Vec<ProcessInfo> {
    let mut processes = Vec::new();

    #[cfg(target_os = "linux")]
    {
        processes.extend(find_processes_ss(port));
    }

    let seen: HashSet<u32> = processes.iter().map(|p| p.pid).collect();
    processes.extend(
        find_processes_lsof(port)
            .into_iter()
            .filter(|p| !seen.contains(&p.pid)),
    );

    processes
}

#[cfg(target_os = "linux")]
fn find_processes_ss(port: u16) -> Vec<ProcessInfo> {
    let output = match Command::new("ss")
        .args(["-tlnp", &format!("sport = :{}", port)])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ss_pids(&stdout)
        .into_iter()
        .map(|pid| ProcessInfo {
            pid,
            name: process_name(pid).unwrap_or_else(|| "unknown".to_string()),
            command: std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
                .ok()
                .map(|s| s.replace('\0', " ").trim().to_string()),
        })
        .collect()
}

/// Extract `pid=N` entries from `ss -p` output, skipping the header.
fn parse_ss_pids(output: &str) -> Vec<u32> {
    let mut seen = HashSet::new();
    let mut pids = Vec::new();
    for line in output.lines().skip(1) {
        let Some(users) = line.split_whitespace().last() else {
            continue;
        };
        for part in users.split(',') {
            if let Some(pid) = part
                .strip_prefix("pid=")
                .and_then(|p| p.parse::<u32>().ok())
            {
                if seen.insert(pid) {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

fn find_processes_lsof(port: u16) -> Vec<ProcessInfo> {
    let output = match Command::new("lsof")
        .args(["-i", &format!(":{}", port), "-P", "-n", "-sTCP:LISTEN", "-F", "pc"])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    parse_lsof_fields(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `lsof -F pc` output: each process block starts with `p<PID>`,
/// followed by `c<COMMAND>`.
fn parse_lsof_fields(output: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = Vec::new();
    let mut seen = HashSet::new();

    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            if let Ok(pid) = pid.parse::<u32>() {
                if seen.insert(pid) {
                    processes.push(ProcessInfo {
                        pid,
                        name: "unknown".to_string(),
                        command: None,
                    });
                }
            }
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(last) = processes.last_mut() {
                if last.command.is_none() {
                    last.name = command.to_string();
                    last.command = Some(command.to_string());
                }
            }
        }
    }

    processes
}

/// Short process name for a PID.
pub fn process_name(pid: u32) -> Option<String> {
    if let Ok(comm) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
        let comm = comm.trim();
        if !comm.is_empty() {
            return Some(comm.to_string());
        }
    }

    let output = Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .ok()?;
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!name.is_empty()).then_some(name)
}
