//! Store-level errors
//!
//! Only some of these count against a store's circuit breaker; see
//! [`StoreError::counts_as_failure`].

use crate::descriptor::{PrincipalId, StoreId};

/// Error raised by a store adapter call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Backend I/O failed
    #[error("store {store_id} i/o failure: {message}")]
    Io { store_id: StoreId, message: String },

    /// Call exceeded its per-call timeout
    #[error("store {store_id} call timed out after {timeout_ms}ms")]
    Timeout { store_id: StoreId, timeout_ms: u64 },

    /// Record or structure could not be decoded
    #[error("store {store_id} corrupted: {detail}")]
    Corrupted { store_id: StoreId, detail: String },

    /// Operation not offered by this store role
    #[error("store {store_id} does not support {operation}")]
    Unsupported {
        store_id: StoreId,
        operation: &'static str,
    },

    /// Caller credential rejected before the store was touched
    #[error("principal {principal} is not authenticated")]
    Unauthenticated { principal: PrincipalId },

    /// Payload could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Build an I/O error
    #[inline]
    pub fn io(store_id: &StoreId, message: impl Into<String>) -> Self {
        Self::Io {
            store_id: store_id.clone(),
            message: message.into(),
        }
    }

    /// Build an unsupported-operation error
    #[inline]
    #[must_use]
    pub fn unsupported(store_id: &StoreId, operation: &'static str) -> Self {
        Self::Unsupported {
            store_id: store_id.clone(),
            operation,
        }
    }

    /// Whether this error is a store failure for circuit-breaker purposes
    #[inline]
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Timeout { .. } | Self::Corrupted { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
