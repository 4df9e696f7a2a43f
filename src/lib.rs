//! # devfleet
//!
//! A local multi-service development orchestrator.
//!
//! ## Features
//!
//! - **Dependency-aware startup**: services start level by level; a level
//!   waits for the previous one to pass its health gate
//! - **Stable ports**: assignments persist per project, explicit ports are
//!   honored exactly and never substituted
//! - **Process supervision**: process groups, graceful stop with SIGKILL
//!   fallback, crash detection, captured output
//! - **Health monitoring**: process, port and HTTP tiers behind a per-service
//!   circuit breaker and rate limiter, with cached reports and change events
//! - **Rollback**: a failed start stops everything it started, in reverse
//! - **Cancellation**: every check and gate observes a `CancellationToken`
//!
//! ## Quick Start
//!
//! ```no_run
//! use devfleet::{Orchestrator, Parser};
//!
//! # async fn example() -> devfleet::Result<()> {
//! let config = Parser::new().load_config("devfleet.yaml")?;
//! let orchestrator = Orchestrator::new(config, std::path::PathBuf::from("."))?;
//!
//! // Start all services (respects dependency order)
//! orchestrator.start_all().await?;
//!
//! // Supervise until Ctrl-C, then stop everything in reverse order
//! orchestrator.run_until_shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Orchestrator methods take `&self`
//! - The registry, the port table and each service's breaker and rate
//!   limiter are guarded independently
//! - Observers receive events through bounded per-observer channels and
//!   never slow down the producer
//! - Cleanup runs exactly once even with concurrent calls

pub mod broadcast;
pub mod config;
pub mod dependency;
pub mod error;
pub mod healthcheck;
pub mod metrics;
pub mod orchestrator;
pub mod port;
pub mod registry;
pub mod service;

// Re-export commonly used types
pub use broadcast::{Broadcaster, SlowObserverPolicy, Subscription};
pub use config::{FleetConfig, GatePolicy, Parser};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use registry::{FleetEvent, Registry, RegistryEntry};
pub use service::{HealthStatus, Status};
