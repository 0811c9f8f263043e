//! Operational status view

use crate::audit::{Escalation, PendingReconciliation};
use crate::detector::Inconsistency;
use crate::executor::RecoveryAttempt;
use crate::health::{HealthSnapshot, HealthStatus};
use crate::transaction::TransactionRecord;
use chrono::{DateTime, Utc};
use msc_breaker::CircuitBreakerState;
use serde::{Deserialize, Serialize};

/// Everything an operator needs to see, serialized as the status document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub overall: HealthStatus,
    pub health: HealthSnapshot,
    pub breakers: Vec<CircuitBreakerState>,
    /// Findings of the latest pass not yet recovered
    pub open_inconsistencies: Vec<Inconsistency>,
    /// Exhausted recoveries and failed compensations
    pub escalations: Vec<Escalation>,
    pub awaiting_acknowledgement: Vec<RecoveryAttempt>,
    pub unacknowledged_transactions: Vec<TransactionRecord>,
    pub pending_reconciliations: Vec<PendingReconciliation>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl StatusView {
    /// Whether an operator has something to act on
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        !self.escalations.is_empty()
            || !self.awaiting_acknowledgement.is_empty()
            || self.overall == HealthStatus::Unavailable
    }

    /// Open inconsistencies left out of recovery because stores were excluded
    #[must_use]
    pub fn stale_count(&self) -> usize {
        self.open_inconsistencies
            .iter()
            .filter(|inconsistency| inconsistency.stale)
            .count()
    }
}
