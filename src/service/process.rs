use super::{LogCapture, LogHub, LogStream, ServiceRuntime, Status};
use crate::error::{validate_pid, validate_pid_for_check, Error, Result};
use crate::port::PortManager;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, killpg, Signal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// A process that exits this soon after spawning is reported as a spawn failure.
pub const STARTUP_CRASH_WINDOW: Duration = Duration::from_millis(300);

/// How long to wait for the process to be reaped after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to let log readers flush the last lines after exit.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Lines of output quoted in a spawn failure.
const CRASH_LOG_PREVIEW_LINES: usize = 10;

/// A live OS process started for one service.
///
/// The handle is the only owner of the child. Dropping it without a
/// graceful stop kills the whole process group so no orphan survives.
#[derive(Debug)]
pub struct ProcessHandle {
    service: String,
    pid: u32,
    port: Option<u16>,
    started_at: DateTime<Utc>,
    child: Child,
    logs: Arc<LogCapture>,
    finished: bool,
}

impl ProcessHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn logs(&self) -> &Arc<LogCapture> {
        &self.logs
    }

    /// Non-blocking exit check. `Some` carries the lifecycle status the exit
    /// maps to.
    pub fn poll_exit(&mut self) -> Option<Status> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.finished = true;
                Some(classify_exit(status))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(service = %self.service, error = %e, "try_wait failed");
                None
            }
        }
    }

    fn signal_group(&self, sig: Signal) -> Result<()> {
        let pid = validate_pid(self.pid, &self.service)?;
        killpg(pid, sig)
            .or_else(|_| signal::kill(pid, sig))
            .map_err(|e| Error::ProcessStop {
                service: self.service.clone(),
                reason: format!("failed to send {} to PID {}: {}", sig, self.pid, e),
            })
    }

    /// SIGTERM the group, wait up to `timeout`, then SIGKILL.
    async fn terminate(&mut self, timeout: Duration) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if let Err(e) = self.signal_group(Signal::SIGTERM) {
            // Already gone is fine, anything else goes straight to SIGKILL
            tracing::debug!(service = %self.service, error = %e, "SIGTERM failed");
        }

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(_)) => {
                tracing::debug!(service = %self.service, "Process exited gracefully");
            }
            Ok(Err(e)) => {
                tracing::warn!(service = %self.service, error = %e, "Error waiting for process");
                self.force_kill().await?;
            }
            Err(_) => {
                tracing::warn!(
                    service = %self.service,
                    grace_period = ?timeout,
                    "Process did not exit after SIGTERM, sending SIGKILL"
                );
                self.force_kill().await?;
            }
        }

        self.finished = true;
        Ok(())
    }

    async fn force_kill(&mut self) -> Result<()> {
        let _ = self.signal_group(Signal::SIGKILL);
        match tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::ProcessStop {
                service: self.service.clone(),
                reason: format!("PID {} survived SIGKILL", self.pid),
            }),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(pid) = validate_pid_for_check(self.pid) {
            tracing::debug!(service = %self.service, pid = self.pid, "Killing process group on drop");
            let _ = killpg(pid, Signal::SIGKILL);
        }
    }
}

/// Map an exit status onto the lifecycle.
///
/// Exit code 0 is a clean stop, other codes a failure, and termination by a
/// signal a crash.
pub fn classify_exit(status: ExitStatus) -> Status {
    use std::os::unix::process::ExitStatusExt;
    if status.success() {
        Status::Stopped
    } else if status.signal().is_some() {
        Status::Crashed
    } else {
        Status::Failed
    }
}

/// True when `pid` exists and is not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    let Some(nix_pid) = validate_pid_for_check(pid) else {
        return false;
    };
    if signal::kill(nix_pid, None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/status", pid))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|l| l.starts_with("State:"))
                .map(|l| l.contains("zombie") || l.split_whitespace().nth(1) == Some("Z"))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(pid: u32) -> bool {
    std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim_start().starts_with('Z'))
        .unwrap_or(false)
}

/// Spawns, tracks and stops service processes.
///
/// Handles live in a map keyed by service name; a stop takes the handle
/// out of the map before awaiting, so no lock is held across a wait.
/// Log buffers outlive their process so the output of a crashed service
/// stays readable, and so does the status of the last reaped exit.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    handles: Mutex<HashMap<String, ProcessHandle>>,
    /// Lock order: `handles` before `exits`.
    exits: Mutex<HashMap<String, Status>>,
    logs: Mutex<HashMap<String, Arc<LogCapture>>>,
    hub: Option<Arc<LogHub>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every service's output to `hub` as well.
    pub fn with_log_hub(hub: Arc<LogHub>) -> Self {
        Self {
            hub: Some(hub),
            ..Self::default()
        }
    }

    pub fn log_hub(&self) -> Option<&Arc<LogHub>> {
        self.hub.as_ref()
    }

    /// Spawn `runtime.command` through `/bin/sh -c "exec ..."` in its own
    /// process group with exactly `runtime.env` (plus `PORT`).
    ///
    /// Returns the PID. A process that dies inside [`STARTUP_CRASH_WINDOW`]
    /// with a failure status is a [`Error::ProcessSpawn`], quoting its last
    /// lines of output.
    #[tracing::instrument(skip(self, runtime), fields(service.name = %runtime.name))]
    pub async fn start_service(&self, runtime: &ServiceRuntime) -> Result<u32> {
        if self.is_running(&runtime.name) {
            return Err(Error::AlreadyRunning(runtime.name.clone()));
        }
        if runtime.command.trim().is_empty() {
            return Err(Error::ProcessSpawn {
                service: runtime.name.clone(),
                reason: "no command configured and none could be detected".to_string(),
            });
        }

        self.exits.lock().remove(&runtime.name);

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(format!("exec {}", runtime.command))
            .current_dir(&runtime.work_dir)
            .env_clear()
            .envs(&runtime.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .process_group(0);
        if let Some(port) = runtime.port {
            cmd.env("PORT", port.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| Error::ProcessSpawn {
            service: runtime.name.clone(),
            reason: format!("{} (work dir: {})", e, runtime.work_dir.display()),
        })?;

        let pid = child.id().ok_or_else(|| Error::ProcessSpawn {
            service: runtime.name.clone(),
            reason: "process exited before its PID could be read".to_string(),
        })?;

        let logs = Arc::new(match &self.hub {
            Some(hub) => LogCapture::with_hub(&runtime.name, hub.clone()),
            None => LogCapture::new(&runtime.name),
        });
        if let Some(stdout) = child.stdout.take() {
            logs.capture(stdout, LogStream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            logs.capture(stderr, LogStream::Stderr);
        }

        let mut handle = ProcessHandle {
            service: runtime.name.clone(),
            pid,
            port: runtime.port,
            started_at: Utc::now(),
            child,
            logs: logs.clone(),
            finished: false,
        };
        tracing::info!(pid, port = ?runtime.port, "Spawned process");

        tokio::time::sleep(STARTUP_CRASH_WINDOW).await;
        if let Some(status) = handle.poll_exit() {
            if status != Status::Stopped {
                logs.drain(LOG_DRAIN_TIMEOUT).await;
                self.logs.lock().insert(runtime.name.clone(), logs.clone());
                return Err(Error::ProcessSpawn {
                    service: runtime.name.clone(),
                    reason: crash_report(&logs),
                });
            }
            tracing::debug!("Process exited cleanly during startup window");
            self.logs.lock().insert(runtime.name.clone(), logs);
            return Ok(pid);
        }

        self.logs.lock().insert(runtime.name.clone(), logs);
        self.handles.lock().insert(runtime.name.clone(), handle);
        Ok(pid)
    }

    /// Graceful stop: SIGTERM the group, wait up to `timeout`, SIGKILL.
    ///
    /// Afterwards the service's port is checked independently of the PID
    /// and whoever still holds it is killed. Stopping a service with no
    /// live process only performs the port check.
    #[tracing::instrument(skip(self), fields(service.name = %service))]
    pub async fn stop_service_graceful(
        &self,
        service: &str,
        port: Option<u16>,
        timeout: Duration,
    ) -> Result<()> {
        let handle = self.handles.lock().remove(service);
        let port = port.or_else(|| handle.as_ref().and_then(|h| h.port));

        if let Some(mut handle) = handle {
            handle.terminate(timeout).await?;
            handle.logs.drain(LOG_DRAIN_TIMEOUT).await;
            tracing::info!(pid = handle.pid, "Process stopped");
        }

        if let Some(port) = port {
            let name = service.to_string();
            tokio::task::spawn_blocking(move || PortManager::ensure_port_free(&name, port))
                .await
                .map_err(|e| Error::ProcessStop {
                    service: service.to_string(),
                    reason: format!("port cleanup task failed: {}", e),
                })??;
        }
        Ok(())
    }

    /// Reap exited processes. Returns each service whose process is gone,
    /// with the status its exit maps to.
    pub fn poll_exits(&self) -> Vec<(String, Status)> {
        let mut handles = self.handles.lock();
        let exited: Vec<(String, Status)> = handles
            .iter_mut()
            .filter_map(|(name, handle)| handle.poll_exit().map(|s| (name.clone(), s)))
            .collect();
        let mut exits = self.exits.lock();
        for (name, status) in &exited {
            handles.remove(name);
            exits.insert(name.clone(), *status);
            tracing::warn!(service = %name, status = %status, "Process exited");
        }
        exited
    }

    /// How the last process of `service` ended, if a reap saw it exit.
    ///
    /// Recorded under the same lock that removes the handle, so once
    /// [`is_running`](Self::is_running) turns false for a reaped process
    /// its status is already here, whichever task reaped it.
    pub fn exit_status(&self, service: &str) -> Option<Status> {
        self.exits.lock().get(service).copied()
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.handles.lock().contains_key(service)
    }

    pub fn pid(&self, service: &str) -> Option<u32> {
        self.handles.lock().get(service).map(|h| h.pid)
    }

    pub fn running_services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handles.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn log_capture(&self, service: &str) -> Option<Arc<LogCapture>> {
        self.logs.lock().get(service).cloned()
    }

    /// Buffered output of `service`, also after its process has exited.
    pub fn read_logs(&self, service: &str, tail: Option<usize>) -> Result<Vec<String>> {
        self.log_capture(service)
            .map(|logs| logs.read_logs(tail))
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))
    }
}

fn crash_report(logs: &LogCapture) -> String {
    let lines = logs.read_logs(Some(CRASH_LOG_PREVIEW_LINES));
    if lines.is_empty() {
        "process crashed during startup (no output captured)".to_string()
    } else {
        format!(
            "process crashed during startup. Last {} lines:\n{}",
            lines.len(),
            lines.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn runtime(name: &str, command: &str) -> ServiceRuntime {
        let env = std::env::vars().collect();
        ServiceRuntime::new(name, command, PathBuf::from("/tmp")).with_env(env)
    }

    #[test]
    fn test_classify_exit() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(classify_exit(ExitStatus::from_raw(0)), Status::Stopped);
        assert_eq!(classify_exit(ExitStatus::from_raw(1 << 8)), Status::Failed);
        assert_eq!(classify_exit(ExitStatus::from_raw(9)), Status::Crashed);
    }

    #[test]
    fn test_current_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let supervisor = ProcessSupervisor::new();
        let pid = supervisor
            .start_service(&runtime("sleeper", "sleep 30"))
            .await
            .unwrap();

        assert!(is_process_alive(pid));
        assert!(supervisor.is_running("sleeper"));
        assert_eq!(supervisor.pid("sleeper"), Some(pid));

        supervisor
            .stop_service_graceful("sleeper", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!supervisor.is_running("sleeper"));
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let supervisor = ProcessSupervisor::new();
        supervisor
            .start_service(&runtime("dup", "sleep 30"))
            .await
            .unwrap();
        let err = supervisor
            .start_service(&runtime("dup", "sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        supervisor
            .stop_service_graceful("dup", None, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let supervisor = ProcessSupervisor::new();
        let err = supervisor
            .start_service(&runtime("ghost", "definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
        assert!(!supervisor.is_running("ghost"));
    }

    #[tokio::test]
    async fn test_output_captured_with_port_env() {
        let mut rt = runtime("echo", "sh -c 'echo port=$PORT; echo oops >&2; sleep 30'");
        rt = rt.with_port(4567);
        let supervisor = ProcessSupervisor::new();
        supervisor.start_service(&rt).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let logs = supervisor.read_logs("echo", None).unwrap();
        assert!(logs.contains(&"port=4567".to_string()));
        assert!(logs.contains(&"[stderr] oops".to_string()));

        supervisor
            .stop_service_graceful("echo", None, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_exits_reports_failure() {
        let supervisor = ProcessSupervisor::new();
        supervisor
            .start_service(&runtime("flaky", "sh -c 'sleep 0.5; exit 3'"))
            .await
            .unwrap();

        let mut exited = Vec::new();
        for _ in 0..30 {
            exited = supervisor.poll_exits();
            if !exited.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(exited, vec![("flaky".to_string(), Status::Failed)]);
        assert!(!supervisor.is_running("flaky"));
        assert_eq!(supervisor.exit_status("flaky"), Some(Status::Failed));

        // A new start forgets the old exit
        supervisor
            .start_service(&runtime("flaky", "sleep 30"))
            .await
            .unwrap();
        assert_eq!(supervisor.exit_status("flaky"), None);
        supervisor
            .stop_service_graceful("flaky", None, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let supervisor = ProcessSupervisor::new();
        let pid = supervisor
            .start_service(&runtime("stubborn", "sh -c 'trap \"\" TERM; sleep 30'"))
            .await
            .unwrap();
        supervisor
            .stop_service_graceful("stubborn", None, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_drop_handle_kills_group() {
        let supervisor = ProcessSupervisor::new();
        let pid = supervisor
            .start_service(&runtime("orphan", "sleep 30"))
            .await
            .unwrap();
        drop(supervisor);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!is_process_alive(pid));
    }
}
