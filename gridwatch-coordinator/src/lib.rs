//! The gridwatch C2: accepts monitor registrations, supervises liveness,
//! computes border regions and distributes them to neighborhood monitors.

pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod liveness;
pub mod peers;
pub mod registry;
pub mod reports;
pub mod service;

pub use coordinator::{Coordinator, CoordinatorStatus};
pub use error::CoordinatorError;
pub use service::{C2Context, SharedContext};
