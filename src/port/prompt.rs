use crate::port::PortConflict;
use std::io::{stdin, stdout, BufRead, Write};

/// What to do about an explicit port that someone else holds.
///
/// Explicit ports are honored exactly or the service fails, so there is no
/// "use another port" choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortConflictAction {
    KillAndRetry,
    Retry,
    Abort,
}

/// Caller-supplied confirmation for freeing an occupied explicit port.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, service: &str, conflict: &PortConflict) -> PortConflictAction;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &PortConflict) -> PortConflictAction + Send + Sync,
{
    fn resolve(&self, service: &str, conflict: &PortConflict) -> PortConflictAction {
        self(service, conflict)
    }
}

/// Always answers with the same action.
#[derive(Debug, Clone, Copy)]
pub struct FixedResolver(pub PortConflictAction);

impl ConflictResolver for FixedResolver {
    fn resolve(&self, _service: &str, _conflict: &PortConflict) -> PortConflictAction {
        self.0
    }
}

/// Asks on the terminal when there is one, declines otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct InteractiveResolver;

impl ConflictResolver for InteractiveResolver {
    fn resolve(&self, service: &str, conflict: &PortConflict) -> PortConflictAction {
        if !is_interactive() {
            return PortConflictAction::Abort;
        }
        prompt_user(service, conflict)
    }
}

/// Check if running in interactive TTY
pub fn is_interactive() -> bool {
    use std::io::IsTerminal;
    if std::env::var_os("DEVFLEET_NON_INTERACTIVE").is_some() {
        return false;
    }
    // Cargo test binaries run from target/*/deps/
    if let Ok(exe) = std::env::current_exe() {
        if let Some(path) = exe.to_str() {
            if path.contains("/deps/") || path.contains("\\deps\\") {
                return false;
            }
        }
    }
    stdin().is_terminal() && stdout().is_terminal()
}

fn prompt_user(service: &str, conflict: &PortConflict) -> PortConflictAction {
    println!();
    println!(
        "Port {} required by '{}' is in use",
        conflict.port, service
    );

    for process in &conflict.processes {
        println!("  PID:     {}", process.pid);
        println!("  Process: {}", process.name);
        if let Some(ref cmd) = process.command {
            println!("  Command: {}", cmd);
        }
    }

    println!();
    println!("  [k] Kill the process and retry");
    println!("  [r] Retry (process may have exited)");
    println!("  [q] Abort");
    print!("Your choice: ");
    stdout().flush().ok();

    let mut line = String::new();
    loop {
        line.clear();
        match stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => return PortConflictAction::Abort,
            Ok(_) => {}
        }
        if let Some(action) = parse_choice(&line) {
            return action;
        }
        print!("Please answer k, r or q: ");
        stdout().flush().ok();
    }
}

fn parse_choice(input: &str) -> Option<PortConflictAction> {
    match input.trim().to_ascii_lowercase().as_str() {
        "k" | "kill" | "y" | "yes" => Some(PortConflictAction::KillAndRetry),
        "r" | "retry" => Some(PortConflictAction::Retry),
        "q" | "quit" | "n" | "no" | "abort" => Some(PortConflictAction::Abort),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("k\n"), Some(PortConflictAction::KillAndRetry));
        assert_eq!(parse_choice(" R "), Some(PortConflictAction::Retry));
        assert_eq!(parse_choice("no"), Some(PortConflictAction::Abort));
        assert_eq!(parse_choice("maybe"), None);
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |_: &str, _: &PortConflict| PortConflictAction::Retry;
        let conflict = PortConflict {
            port: 1,
            processes: vec![],
        };
        assert_eq!(resolver.resolve("svc", &conflict), PortConflictAction::Retry);
    }

    #[test]
    fn test_interactive_resolver_declines_in_tests() {
        let conflict = PortConflict {
            port: 1,
            processes: vec![],
        };
        assert_eq!(
            InteractiveResolver.resolve("svc", &conflict),
            PortConflictAction::Abort
        );
    }
}
