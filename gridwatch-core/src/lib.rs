//! Shared building blocks of the gridwatch intrusion-detection overlay:
//! the substation topology model, border-region computation, the requirement
//! engine, wire contracts and the transport the processes talk over.

pub mod border_region;
pub mod config;
pub mod contracts;
pub mod error;
pub mod queue;
pub mod requirements;
pub mod rpc;
pub mod snapshot;
pub mod state;
pub mod telemetry;
pub mod topology;
pub mod transport;

pub use border_region::BorderRegion;
pub use error::{ConfigError, RequirementError, RpcError, TopologyError, TransportError};
pub use snapshot::Snapshot;
pub use state::{new_state, Shared};
pub use topology::Topology;
