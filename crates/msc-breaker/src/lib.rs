//! MSC Breaker - fault isolation for store access
//!
//! - [`CircuitBreaker`]: per-store CLOSED / OPEN / HALF_OPEN state machine
//! - [`GuardedStore`]: adapter + breaker + per-call timeout
//! - [`StoreRegistry`]: global stores and lazily materialized analytics stores

#![warn(unreachable_pub)]

pub mod breaker;
pub mod guarded;
pub mod registry;

pub use breaker::{
    BreakerConfig, BreakerState, BreakerTransition, CallError, CircuitBreaker,
    CircuitBreakerState, Permit, Rejected,
};
pub use guarded::{GuardedStore, ProbeOutcome};
pub use registry::{AnalyticsFactory, RegistryError, RoleTimeouts, StoreRegistry, StoreRegistryBuilder};
