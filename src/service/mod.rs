//! Process supervision for local services.
//!
//! - [`ProcessSupervisor`] spawns and stops processes and owns their
//!   [`ProcessHandle`]s
//! - [`LogCapture`] buffers and streams process output
//! - [`OperationTracker`] rejects overlapping start/stop/restart requests
//! - [`RunnerRegistry`] derives launch commands and default ports
//!
//! # Example
//!
//! ```no_run
//! use devfleet::service::{ProcessSupervisor, ServiceRuntime};
//! use std::path::PathBuf;
//! use std::time::Duration;
//!
//! # async fn example() -> devfleet::Result<()> {
//! let supervisor = ProcessSupervisor::new();
//! let runtime = ServiceRuntime::new("api", "python3 -m http.server $PORT", PathBuf::from("."))
//!     .with_env(std::env::vars().collect())
//!     .with_port(8000);
//! let pid = supervisor.start_service(&runtime).await?;
//! println!("api running as {}", pid);
//! supervisor
//!     .stop_service_graceful("api", Some(8000), Duration::from_secs(10))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod log_capture;
mod operation;
mod process;
mod runner;
mod types;

pub use log_capture::*;
pub use operation::*;
pub use process::*;
pub use runner::*;
pub use types::*;
