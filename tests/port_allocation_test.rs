//! Port assignment under concurrency and across runs.

use devfleet::port::{FixedResolver, JsonFilePortStore, PortConflictAction, PortManager, PortRange};
use devfleet::Error;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;
use tempfile::TempDir;

fn file_manager(state: &TempDir, project: &TempDir, range: (u16, u16)) -> PortManager {
    let store = JsonFilePortStore::in_dir(state.path(), project.path());
    PortManager::new(project.path(), Box::new(store))
        .unwrap()
        .with_range(PortRange::new(range.0, range.1).unwrap())
        .with_resolver(Box::new(FixedResolver(PortConflictAction::Abort)))
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_assignments_are_unique() {
    let state = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let manager = Arc::new(file_manager(&state, &project, (44200, 44299)));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.assign_port(&format!("svc{}", i), 0, false, false))
        })
        .collect();

    let ports: Vec<u16> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();
    let unique: HashSet<u16> = ports.iter().copied().collect();
    assert_eq!(unique.len(), ports.len());
    assert!(ports.iter().all(|p| (44200..=44299).contains(p)));
    assert_eq!(manager.assignments().len(), 8);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_next_run_gets_the_same_ports() {
    let state = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    let first = {
        let manager = file_manager(&state, &project, (44300, 44399));
        (
            manager.assign_port("api", 0, false, false).unwrap(),
            manager.assign_port("web", 0, false, false).unwrap(),
        )
    };

    let manager = file_manager(&state, &project, (44300, 44399));
    let second = (
        manager.assign_port("api", 0, false, false).unwrap(),
        manager.assign_port("web", 0, false, false).unwrap(),
    );
    assert_eq!(first, second);
}

#[test]
fn test_projects_do_not_share_tables() {
    let state = TempDir::new().unwrap();
    let one = TempDir::new().unwrap();
    let two = TempDir::new().unwrap();

    file_manager(&state, &one, (44400, 44499))
        .assign_port("api", 0, false, false)
        .unwrap();

    assert!(file_manager(&state, &two, (44400, 44499)).assignments().is_empty());
}

// ============================================================================
// Explicit ports
// ============================================================================

#[test]
fn test_busy_explicit_port_is_never_substituted() {
    let state = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let manager = file_manager(&state, &project, (port, port));

    let err = manager.assign_port("db", port, true, false).unwrap_err();

    match err {
        Error::PortConflict { service, port: p, .. } => {
            assert_eq!(service, "db");
            assert_eq!(p, port);
        }
        other => panic!("expected a port conflict, got {:?}", other),
    }
    assert!(manager.get_assignment("db").is_none());
}
