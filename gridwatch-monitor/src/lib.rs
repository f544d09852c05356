//! gridwatch monitors: the Local Monitor (one per substation) and the
//! Neighborhood Monitor (one per group of border regions).

pub mod config;
pub mod local;
pub mod neighborhood;
pub mod runtime;
pub mod sensors;
pub mod usage;

pub use local::LocalMonitor;
pub use neighborhood::NeighborhoodMonitor;
pub use sensors::{JsonFileSource, SensorError, SensorSource, StaticSource};

use gridwatch_core::config::EXIT_CONFIG;
use std::fmt::Display;

/// Unwraps a startup step whose failure means the process is misconfigured,
/// exiting with [`EXIT_CONFIG`] otherwise.
pub fn or_exit_config<T, E: Display>(result: Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(error = %e, "{what}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}
