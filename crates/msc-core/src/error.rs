//! Error types for MSC Core
//!
//! Classification:
//! - `StoreUnavailable`: breaker open, recoverable once the store returns
//! - `StoreDegraded`: logged by the health monitor, never retried
//! - `InconsistencyDetected`: informational, never returned to application callers
//! - `RecoveryExhausted` / `CompensationFailed`: escalated to an operator

use crate::ids::TransactionId;
use msc_breaker::{CallError, RegistryError};
use msc_store::{PrincipalId, StoreError, StoreId};

/// Main consistency error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsistencyError {
    /// Circuit breaker for the store is open
    #[error("store {store_id} unavailable, retry later")]
    StoreUnavailable { store_id: StoreId },

    /// Store answers but is slow or reports warnings
    #[error("store {store_id} degraded: {reason}")]
    StoreDegraded { store_id: StoreId, reason: String },

    /// A detection pass found inconsistencies
    #[error("{count} inconsistencies detected")]
    InconsistencyDetected { count: usize },

    /// Every recovery strategy failed for a target
    #[error("recovery exhausted for {target} after {attempts} attempts")]
    RecoveryExhausted { target: String, attempts: usize },

    /// At least one compensating action failed
    #[error("compensation failed for transaction {transaction_id} on {failed:?}")]
    CompensationFailed {
        transaction_id: TransactionId,
        failed: Vec<StoreId>,
    },

    /// Credential check failed before an identity write
    #[error("principal {principal} is not authenticated")]
    Unauthenticated { principal: PrincipalId },

    /// Transaction cancelled before executing
    #[error("transaction cancelled")]
    Cancelled,

    /// The task driving a transaction ended without a terminal record
    #[error("transaction {transaction_id} interrupted: {reason}")]
    TransactionInterrupted {
        transaction_id: TransactionId,
        reason: String,
    },

    /// Store id not present in the registry
    #[error("unknown store: {0}")]
    UnknownStore(StoreId),

    /// No open inconsistency with this id
    #[error("unknown inconsistency: {0}")]
    UnknownInconsistency(String),

    /// Inconsistency was detected with stores excluded and cannot be acted on
    #[error("inconsistency {0} is stale; wait for a full detection pass")]
    StaleInconsistency(String),

    /// Store call failed for a reason the breaker does not absorb
    #[error("store error: {0}")]
    Store(StoreError),

    /// Invalid configuration or topology
    #[error("configuration error: {0}")]
    Config(String),

    /// Coordinator state could not be saved or loaded
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ConsistencyError {
    /// Check if the caller may retry later
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. } | Self::StoreDegraded { .. } => true,
            Self::Store(err) => err.counts_as_failure(),
            _ => false,
        }
    }

    /// Check if the error must reach an operator
    #[inline]
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::RecoveryExhausted { .. } | Self::CompensationFailed { .. }
        )
    }

    /// Create a configuration error
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<CallError> for ConsistencyError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Unavailable { store_id } => Self::StoreUnavailable { store_id },
            CallError::Store(err) => err.into(),
        }
    }
}

impl From<StoreError> for ConsistencyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unauthenticated { principal } => Self::Unauthenticated { principal },
            other => Self::Store(other),
        }
    }
}

impl From<RegistryError> for ConsistencyError {
    fn from(err: RegistryError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::de::Error> for ConsistencyError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_rejection_maps_to_unavailable() {
        let err: ConsistencyError = CallError::Unavailable {
            store_id: StoreId::new("metadata"),
        }
        .into();
        assert!(matches!(err, ConsistencyError::StoreUnavailable { .. }));
        assert!(err.is_retryable());
        assert!(!err.requires_operator());
    }

    #[test]
    fn unauthenticated_is_not_an_outage() {
        let err: ConsistencyError = CallError::Store(StoreError::Unauthenticated {
            principal: PrincipalId::new("p1"),
        })
        .into();
        assert!(matches!(err, ConsistencyError::Unauthenticated { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn escalations_require_operator() {
        let err = ConsistencyError::RecoveryExhausted {
            target: "analytics:p1".to_string(),
            attempts: 4,
        };
        assert!(err.requires_operator());
        assert!(!err.is_retryable());
    }
}
