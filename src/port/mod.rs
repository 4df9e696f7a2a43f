//! Port allocation, reservation and persistence.

pub mod conflict;
pub mod manager;
pub mod prompt;
pub mod reservation;
pub mod store;

pub use conflict::{find_processes_on_port, is_port_available, PortConflict, ProcessInfo};
pub use manager::{PortManager, PortRange};
pub use prompt::{ConflictResolver, FixedResolver, InteractiveResolver, PortConflictAction};
pub use reservation::PortReservation;
pub use store::{project_hash, JsonFilePortStore, MemoryPortStore, PortAssignment, PortStore};
