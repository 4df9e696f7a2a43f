//! Project-level coordination of ports, processes and health.
//!
//! - `core` - [`Orchestrator`]: level-by-level start, health gate, rollback, shutdown
//! - `lifecycle` - guarded single-service and bulk commands
//! - `monitoring` - background sweep for crashed processes and health changes
//! - `ports` - port requests and release through the blocking port manager
//! - `builder` - [`OrchestratorBuilder`]

mod builder;
mod core;
mod lifecycle;
mod monitoring;
mod ports;

pub use builder::OrchestratorBuilder;
pub use core::*;
