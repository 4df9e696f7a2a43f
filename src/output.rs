/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so the
/// streams stay consistent: results on stdout, warnings on stderr. Process
/// output streamed by `up` bypasses it.
pub trait UserOutput: Send + Sync {
    /// Informational line, also used for machine-readable output.
    fn status(&self, message: &str);

    /// Success message (e.g., "All services started.")
    fn success(&self, message: &str);

    /// Warning message (e.g., "No services declared")
    fn warning(&self, message: &str);

    /// A blank line separator.
    fn blank(&self);
}

/// Standard CLI output.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("{}", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn blank(&self) {
        println!();
    }
}
