//! MSC Core - multi-store consistency and recovery coordination
//!
//! The coordinator that:
//! - Monitors the health of every persistence store
//! - Detects entities that disagree across stores
//! - Selects and executes recovery strategies with fallbacks
//! - Wraps multi-store application writes in compensating transactions
//! - Persists its own state in the metadata store's reserved namespace
//!
//! # Example
//!
//! ```rust,ignore
//! use msc_core::{ConsistencyConfig, ConsistencyService, WriteStep};
//!
//! # async fn example(registry: std::sync::Arc<msc_breaker::StoreRegistry>) -> Result<(), msc_core::ConsistencyError> {
//! let service = ConsistencyService::builder(ConsistencyConfig::new(), registry).build()?;
//! service.restore().await?;
//!
//! let report = service.run_cycle().await?;
//! println!("{} inconsistencies, {} recovered", report.detected, report.recovered.len());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod config;
pub mod detector;
pub mod error;
pub mod executor;
pub mod health;
pub mod ids;
pub mod persistence;
pub mod service;
pub mod status;
pub mod strategy;
pub mod transaction;

pub use audit::{
    AuditLog, Audited, DetectionPass, Escalation, EscalationKind, Escalations,
    InconsistencyHistory, PendingReconciliation, ReconciliationQueue,
};
pub use config::{
    AuditSettings, BreakerSettings, ConsistencyConfig, EntityTypeSpec, HealthSettings, Ownership,
    RebuildRule, RecoverySettings, ScanSettings, StoreConfig, TimeoutSettings, TopologyConfig,
};
pub use detector::{Inconsistency, InconsistencyDetector, KnownEntities, Severity, StoreListing};
pub use error::ConsistencyError;
pub use executor::{
    AlertSink, AllowAll, AttemptStatus, Collaborators, CredentialGate, RecoveryAttempt,
    RecoveryExecutor, RecoveryOutcome, RecoveryReport, TracingAlertSink,
};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus, StoreHealth};
pub use ids::{AttemptId, EscalationId, InconsistencyId, TransactionId};
pub use persistence::StateStore;
pub use service::{ConsistencyService, ConsistencyServiceBuilder, CycleReport};
pub use status::StatusView;
pub use strategy::{
    BackupCatalog, BackupInfo, DataLoss, NoBackups, PlannedStrategy, RecoveryPlan,
    RecoveryTarget, Strategy, StrategyEngine,
};
pub use transaction::{
    CompensationEntry, CompensationOutcome, PreparedTransaction, StepAction,
    TransactionCoordinator, TransactionPhase, TransactionRecord, WriteStep,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with MSC Core
    pub use crate::{
        ConsistencyConfig, ConsistencyError, ConsistencyService, HealthStatus, Inconsistency,
        RecoveryOutcome, StatusView, Strategy, TransactionPhase, WriteStep,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
