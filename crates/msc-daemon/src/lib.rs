//! MSC Daemon - runs the consistency service as a process
//!
//! - Builds the store registry from the TOML topology
//! - Restores persisted coordinator state and starts the scan loop
//! - Serves the operational HTTP routes

#![warn(unreachable_pub)]

pub mod routes;
pub mod topology;

pub use routes::routes;
pub use topology::build_registry;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
