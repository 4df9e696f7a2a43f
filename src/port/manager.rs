use super::conflict::{is_port_available, PortConflict};
use super::prompt::{ConflictResolver, InteractiveResolver, PortConflictAction};
use super::reservation::PortReservation;
use super::store::{JsonFilePortStore, MemoryPortStore, PortAssignment, PortStore};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT_RANGE_START: u16 = 3000;
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;
pub const PORT_RANGE_START_ENV: &str = "DEVFLEET_PORT_RANGE_START";
pub const PORT_RANGE_END_ENV: &str = "DEVFLEET_PORT_RANGE_END";

/// Candidates probed per scan phase.
pub const MAX_PORT_SCAN_ATTEMPTS: u32 = 100;
/// Kill/verify rounds when freeing a port.
pub const PORT_CLEANUP_RETRIES: u32 = 4;
pub const PORT_CLEANUP_RETRY_WAIT: Duration = Duration::from_millis(500);
/// Assignments unused for this long are dropped by `clean_stale_ports`.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Retries of an occupied explicit port when the resolver answers `Retry`.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Inclusive range of ports the manager hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(Error::Config(format!(
                "Invalid port range {}-{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range from `DEVFLEET_PORT_RANGE_START` / `_END`, falling back to
    /// defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let read = |key: &str, default: u16| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse::<u16>().ok())
                .unwrap_or(default)
        };
        let start = read(PORT_RANGE_START_ENV, DEFAULT_PORT_RANGE_START);
        let end = read(PORT_RANGE_END_ENV, DEFAULT_PORT_RANGE_END);
        PortRange::new(start, end).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring port range override");
            PortRange::default()
        })
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn len(&self) -> u32 {
        (self.end - self.start) as u32 + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Port at `offset` from the start, wrapping modulo the range.
    fn nth(&self, offset: u32) -> u16 {
        self.start + (offset % self.len()) as u16
    }
}

/// Race-free allocation of TCP ports for one project.
///
/// Assignments are unique within the project and persisted through a
/// [`PortStore`] so repeated runs get the same ports. All state sits behind
/// short-lived mutexes; conflict resolution (which may prompt or kill
/// processes) runs without the table lock held.
pub struct PortManager {
    project_dir: PathBuf,
    range: PortRange,
    assignments: Mutex<HashMap<String, PortAssignment>>,
    /// Ports held by live [`PortReservation`]s.
    held: Arc<Mutex<HashSet<u16>>>,
    store: Box<dyn PortStore>,
    resolver: Box<dyn ConflictResolver>,
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("project_dir", &self.project_dir)
            .field("range", &self.range)
            .field("assignments", &self.assignments.lock().len())
            .finish_non_exhaustive()
    }
}

impl PortManager {
    /// Manager backed by `store`, with the range taken from the environment.
    pub fn new(project_dir: impl Into<PathBuf>, store: Box<dyn PortStore>) -> Result<Self> {
        let assignments = store.load()?;
        Ok(Self {
            project_dir: project_dir.into(),
            range: PortRange::from_env(),
            assignments: Mutex::new(assignments),
            held: Arc::new(Mutex::new(HashSet::new())),
            store,
            resolver: Box::new(InteractiveResolver),
        })
    }

    /// Manager persisting to `~/.devfleet/ports/<project-hash>.json`.
    pub fn for_project(project_dir: &Path) -> Result<Self> {
        let store = JsonFilePortStore::for_project(project_dir)?;
        Self::new(project_dir, Box::new(store))
    }

    /// Manager that forgets everything when dropped.
    pub fn in_memory(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            range: PortRange::from_env(),
            assignments: Mutex::new(HashMap::new()),
            held: Arc::new(Mutex::new(HashSet::new())),
            store: Box::new(MemoryPortStore::new()),
            resolver: Box::new(InteractiveResolver),
        }
    }

    pub fn with_range(mut self, range: PortRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Assign a port to `name`.
    ///
    /// An explicit port is honored exactly: when it is occupied the resolver
    /// decides between killing the holder and failing with
    /// [`Error::PortConflict`]; no alternate port is ever chosen. A
    /// non-explicit request reuses the service's previous port when still
    /// free, then tries `preferred`, then scans for the next free port.
    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub fn assign_port(
        &self,
        name: &str,
        preferred: u16,
        is_explicit: bool,
        clean_stale: bool,
    ) -> Result<u16> {
        if clean_stale {
            self.clean_stale_ports()?;
        }

        if is_explicit {
            self.assign_explicit(name, preferred)
        } else {
            self.assign_dynamic(name, preferred)
        }
    }

    fn validate_explicit(&self, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidPort {
                port: 0,
                reason: "port must be between 1 and 65535".to_string(),
            });
        }
        if !self.range.contains(port) {
            return Err(Error::InvalidPort {
                port: port as u32,
                reason: format!(
                    "outside the allowed range {}-{}",
                    self.range.start, self.range.end
                ),
            });
        }
        Ok(())
    }

    fn assign_explicit(&self, name: &str, port: u16) -> Result<u16> {
        self.validate_explicit(port)?;

        if let Some(owner) = Self::owner_of(&self.assignments.lock(), port, name) {
            return Err(Error::Config(format!(
                "Port {} is required by both '{}' and '{}'",
                port, owner, name
            )));
        }

        let mut retries = 0;
        loop {
            if self.is_free(port) {
                let mut table = self.assignments.lock();
                if let Some(owner) = Self::owner_of(&table, port, name) {
                    return Err(Error::Config(format!(
                        "Port {} is required by both '{}' and '{}'",
                        port, owner, name
                    )));
                }
                self.record(&mut table, name, port);
                tracing::info!(port, "Assigned explicit port");
                return Ok(port);
            }

            let conflict = PortConflict::check(port).unwrap_or(PortConflict {
                port,
                processes: Vec::new(),
            });

            match self.resolver.resolve(name, &conflict) {
                PortConflictAction::KillAndRetry => {
                    if let Err(e) =
                        conflict.kill_and_verify(PORT_CLEANUP_RETRIES, PORT_CLEANUP_RETRY_WAIT)
                    {
                        tracing::warn!(port, error = %e, "Could not free explicit port");
                        return Err(conflict_error(name, &conflict));
                    }
                }
                PortConflictAction::Retry if retries < MAX_CONFLICT_RETRIES => {
                    retries += 1;
                    std::thread::sleep(PORT_CLEANUP_RETRY_WAIT);
                }
                PortConflictAction::Retry | PortConflictAction::Abort => {
                    return Err(conflict_error(name, &conflict));
                }
            }
        }
    }

    fn assign_dynamic(&self, name: &str, preferred: u16) -> Result<u16> {
        let mut table = self.assignments.lock();

        if let Some(existing) = table.get(name).map(|a| a.port) {
            if Self::owner_of(&table, existing, name).is_none() && self.is_free(existing) {
                if let Some(assignment) = table.get_mut(name) {
                    assignment.touch();
                }
                self.persist(&table);
                tracing::debug!(port = existing, "Reusing previous port");
                return Ok(existing);
            }
        }

        let port = self
            .candidates(preferred)
            .find(|&port| Self::owner_of(&table, port, name).is_none() && self.is_free(port))
            .ok_or(Error::PortRangeExhausted {
                start: self.range.start,
                end: self.range.end,
            })?;

        if preferred != 0 && port != preferred {
            tracing::info!(preferred, port, "Preferred port busy, using next free port");
        }
        self.record(&mut table, name, port);
        Ok(port)
    }

    /// Reserve a port for `name` by binding a placeholder listener.
    ///
    /// Ports assigned to other services of the project are skipped. The
    /// service's previous port is tried first when no preference is given.
    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub fn find_and_reserve_port(&self, name: &str, preferred: u16) -> Result<PortReservation> {
        let mut table = self.assignments.lock();

        let previous = if preferred == 0 {
            table.get(name).map(|a| a.port)
        } else {
            None
        };

        let candidates = previous.into_iter().chain(self.candidates(preferred));
        for port in candidates {
            if Self::owner_of(&table, port, name).is_some() || !self.is_free(port) {
                continue;
            }
            match PortReservation::bind(name, port, self.held.clone()) {
                Ok(reservation) => {
                    self.record(&mut table, name, port);
                    tracing::debug!(port, "Reserved port");
                    return Ok(reservation);
                }
                Err(e) => {
                    tracing::debug!(port, error = %e, "Lost race for port, trying next");
                }
            }
        }

        Err(Error::PortRangeExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Hold the already assigned `port` of `name` until its process binds it.
    ///
    /// Fails with [`Error::PortConflict`] when another process took the port
    /// after it was assigned.
    pub fn reserve_port(&self, name: &str, port: u16) -> Result<PortReservation> {
        PortReservation::bind(name, port, self.held.clone()).map_err(|e| {
            tracing::warn!(service = %name, port, error = %e, "Assigned port was taken before start");
            let conflict = PortConflict::check(port).unwrap_or(PortConflict {
                port,
                processes: Vec::new(),
            });
            conflict_error(name, &conflict)
        })
    }

    /// Drop the assignment of a stopped service.
    pub fn release(&self, name: &str) -> Result<()> {
        let mut table = self.assignments.lock();
        if table.remove(name).is_some() {
            tracing::debug!(service = %name, "Released port assignment");
            self.store.save(&table)?;
        }
        Ok(())
    }

    pub fn get_assignment(&self, name: &str) -> Option<PortAssignment> {
        self.assignments.lock().get(name).cloned()
    }

    /// All assignments sorted by service name.
    pub fn assignments(&self) -> Vec<PortAssignment> {
        let mut list: Vec<_> = self.assignments.lock().values().cloned().collect();
        list.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        list
    }

    /// Remove assignments unused for longer than [`STALE_THRESHOLD`].
    pub fn clean_stale_ports(&self) -> Result<usize> {
        let threshold = chrono::Duration::from_std(STALE_THRESHOLD)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = Utc::now() - threshold;

        let mut table = self.assignments.lock();
        let before = table.len();
        table.retain(|_, a| a.last_used >= cutoff);
        let removed = before - table.len();
        if removed > 0 {
            tracing::info!(removed, "Cleaned stale port assignments");
            self.store.save(&table)?;
        }
        Ok(removed)
    }

    /// Make sure nothing still listens on `port` after `service` stopped.
    ///
    /// Whoever holds it is killed (this process excepted) and the port is
    /// re-checked up to [`PORT_CLEANUP_RETRIES`] times. Blocks the thread.
    pub fn ensure_port_free(service: &str, port: u16) -> Result<()> {
        let Some(conflict) = PortConflict::check(port) else {
            return Ok(());
        };
        if conflict.processes.is_empty() {
            tracing::debug!(service = %service, port, "Port busy but no holder found");
            return Err(conflict_error(service, &conflict));
        }

        tracing::warn!(
            service = %service,
            port,
            pids = ?conflict.processes.iter().map(|p| p.pid).collect::<Vec<_>>(),
            "Port still held after stop, freeing it"
        );
        conflict
            .kill_and_verify(PORT_CLEANUP_RETRIES, PORT_CLEANUP_RETRY_WAIT)
            .map_err(|_| conflict_error(service, &conflict))
    }

    fn is_free(&self, port: u16) -> bool {
        !self.held.lock().contains(&port) && is_port_available(port)
    }

    /// Service other than `name` that already owns `port`.
    fn owner_of(table: &HashMap<String, PortAssignment>, port: u16, name: &str) -> Option<String> {
        table
            .values()
            .find(|a| a.port == port && a.service_name != name)
            .map(|a| a.service_name.clone())
    }

    /// `preferred` (when inside the range), a sequential scan upward from it,
    /// then a scan from a random offset.
    fn candidates(&self, preferred: u16) -> impl Iterator<Item = u16> + '_ {
        let range = self.range;
        let first = (preferred != 0 && range.contains(preferred)).then_some(preferred);
        let base = match first {
            Some(p) => (p - range.start) as u32 + 1,
            None => rand::thread_rng().gen_range(0..range.len()),
        };
        let random = rand::thread_rng().gen_range(0..range.len());
        let attempts = MAX_PORT_SCAN_ATTEMPTS.min(range.len());

        first
            .into_iter()
            .chain((0..attempts).map(move |i| range.nth(base + i)))
            .chain((0..attempts).map(move |i| range.nth(random + i)))
    }

    fn record(&self, table: &mut HashMap<String, PortAssignment>, name: &str, port: u16) {
        table.insert(name.to_string(), PortAssignment::new(name, port));
        self.persist(table);
    }

    fn persist(&self, table: &HashMap<String, PortAssignment>) {
        if let Err(e) = self.store.save(table) {
            tracing::warn!(error = %e, "Failed to persist port assignments");
        }
    }
}

fn conflict_error(service: &str, conflict: &PortConflict) -> Error {
    let holder = conflict.primary();
    Error::PortConflict {
        service: service.to_string(),
        port: conflict.port,
        pid: holder.map(|p| p.pid),
        process_name: holder.map(|p| p.name.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::FixedResolver;
    use std::net::TcpListener;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> PortManager {
        PortManager::in_memory(dir)
            .with_range(PortRange::new(20000, 60000).unwrap())
            .with_resolver(Box::new(FixedResolver(PortConflictAction::Abort)))
    }

    fn busy_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_range_wraps() {
        let range = PortRange::new(10, 12).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range.nth(0), 10);
        assert_eq!(range.nth(3), 10);
        assert_eq!(range.nth(4), 11);
        assert!(PortRange::new(12, 10).is_err());
        assert!(PortRange::new(0, 10).is_err());
    }

    #[test]
    fn test_dynamic_assignment_is_reused() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());

        let first = pm.assign_port("api", 0, false, false).unwrap();
        let second = pm.assign_port("api", 0, false, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(pm.get_assignment("api").unwrap().port, first);
    }

    #[test]
    fn test_dynamic_skips_busy_preferred() {
        let dir = TempDir::new().unwrap();
        let (_listener, port) = busy_port();
        let pm = PortManager::in_memory(dir.path())
            .with_range(PortRange::new(1024, 65535).unwrap())
            .with_resolver(Box::new(FixedResolver(PortConflictAction::Abort)));

        let assigned = pm.assign_port("web", port, false, false).unwrap();
        assert_ne!(assigned, port);
    }

    #[test]
    fn test_explicit_busy_port_fails_without_fallback() {
        let dir = TempDir::new().unwrap();
        let (_listener, port) = busy_port();
        let pm = PortManager::in_memory(dir.path())
            .with_range(PortRange::new(1024, 65535).unwrap())
            .with_resolver(Box::new(FixedResolver(PortConflictAction::Abort)));

        let err = pm.assign_port("web", port, true, false).unwrap_err();
        match err {
            Error::PortConflict {
                service, port: p, ..
            } => {
                assert_eq!(service, "web");
                assert_eq!(p, port);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(pm.get_assignment("web").is_none());
    }

    #[test]
    fn test_explicit_outside_range_is_invalid() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());
        assert!(matches!(
            pm.assign_port("web", 80, true, false),
            Err(Error::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_explicit_port_shared_by_two_services_rejected() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());
        let port = pm.assign_port("a", 0, false, false).unwrap();
        let err = pm.assign_port("b", port, true, false).unwrap_err();
        assert!(err.to_string().contains("required by both"));
    }

    #[test]
    fn test_ports_are_unique_across_services() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());

        let mut seen = HashSet::new();
        for i in 0..20 {
            let port = pm.assign_port(&format!("svc{}", i), 30000, false, false).unwrap();
            assert!(seen.insert(port), "port {} handed out twice", port);
        }
    }

    #[test]
    fn test_reservation_excludes_other_services() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());

        let taken = pm.assign_port("db", 0, false, false).unwrap();
        let mut reservation = pm.find_and_reserve_port("api", taken).unwrap();
        assert_ne!(reservation.port(), taken);
        assert_eq!(pm.get_assignment("api").unwrap().port, reservation.port());

        // While reserved, nobody else may get it.
        let other = pm.assign_port("web", reservation.port(), false, false).unwrap();
        assert_ne!(other, reservation.port());

        reservation.release();
        assert!(is_port_available(reservation.port()));
    }

    #[test]
    fn test_release_removes_assignment() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());
        pm.assign_port("api", 0, false, false).unwrap();
        pm.release("api").unwrap();
        assert!(pm.get_assignment("api").is_none());
        pm.release("api").unwrap();
    }

    #[test]
    fn test_clean_stale_ports() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());
        pm.assign_port("old", 0, false, false).unwrap();
        pm.assign_port("new", 0, false, false).unwrap();
        pm.assignments.lock().get_mut("old").unwrap().last_used =
            Utc::now() - chrono::Duration::days(8);

        assert_eq!(pm.clean_stale_ports().unwrap(), 1);
        assert!(pm.get_assignment("old").is_none());
        assert!(pm.get_assignment("new").is_some());
    }

    #[test]
    fn test_assignments_persist_across_managers() {
        let state = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();

        let port = {
            let store = JsonFilePortStore::in_dir(state.path(), project.path());
            let pm = PortManager::new(project.path(), Box::new(store))
                .unwrap()
                .with_range(PortRange::new(20000, 60000).unwrap());
            pm.assign_port("api", 0, false, false).unwrap()
        };

        let store = JsonFilePortStore::in_dir(state.path(), project.path());
        let pm = PortManager::new(project.path(), Box::new(store))
            .unwrap()
            .with_range(PortRange::new(20000, 60000).unwrap());
        assert_eq!(pm.assign_port("api", 0, false, false).unwrap(), port);
    }

    #[test]
    fn test_ensure_port_free_on_free_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(PortManager::ensure_port_free("api", port).is_ok());
    }

    #[test]
    fn test_reserve_assigned_port() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());
        let port = pm.assign_port("api", 0, false, false).unwrap();

        let mut reservation = pm.reserve_port("api", port).unwrap();
        assert!(!is_port_available(port));
        reservation.release();
        assert!(is_port_available(port));
    }

    #[test]
    fn test_reserve_port_taken_by_another_process() {
        let dir = TempDir::new().unwrap();
        let pm = manager(dir.path());
        let port = pm.assign_port("api", 0, false, false).unwrap();
        let _intruder = TcpListener::bind(("127.0.0.1", port)).unwrap();

        let err = pm.reserve_port("api", port).unwrap_err();
        assert!(matches!(err, Error::PortConflict { port: p, .. } if p == port));
    }
}
