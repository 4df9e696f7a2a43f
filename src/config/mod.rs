//! Configuration types and loading.
//!
//! - `types` - root [`FleetConfig`], [`OrchestratorConfig`], [`GatePolicy`]
//! - `service` - [`ServiceSpec`], [`PortSpec`], [`HealthCheckSpec`]
//! - `health` - [`MonitorConfig`]
//! - `duration` - human-readable durations
//! - `env_loader` - `.env` files and layered environment merging
//! - `parser` - YAML loading

pub mod env_loader;

mod duration;
mod health;
mod parser;
mod service;
mod types;

pub use duration::*;
pub use health::*;
pub use parser::*;
pub use service::*;
pub use types::*;
