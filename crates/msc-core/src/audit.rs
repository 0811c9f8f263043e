//! In-memory audit trails
//!
//! - [`AuditLog`]: append-only, pruned by a retention window
//! - [`Escalations`]: operator-facing failures, kept until resolved
//! - [`ReconciliationQueue`]: compensations handed off for later repair
//! - [`InconsistencyHistory`]: the last N detection passes

use crate::detector::Inconsistency;
use crate::ids::{AttemptId, EscalationId, InconsistencyId, TransactionId};
use chrono::{DateTime, Utc};
use msc_store::{EntityKey, StoreId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Record with an audit timestamp
pub trait Audited: Clone + Send + Sync {
    /// Time the record reached its terminal state
    fn audited_at(&self) -> DateTime<Utc>;
}

/// Append-only log pruned by age
#[derive(Debug)]
pub struct AuditLog<T> {
    retention: chrono::Duration,
    entries: RwLock<VecDeque<T>>,
}

impl<T: Audited> AuditLog<T> {
    /// Create a log keeping entries for `retention`
    #[must_use]
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            retention,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Append a record and drop expired ones
    pub fn append(&self, entry: T) {
        let mut entries = self.entries.write();
        entries.push_back(entry);
        prune(&mut entries, self.retention, Utc::now());
    }

    /// Merge entries loaded from persistence, keeping them oldest first
    ///
    /// Returns the number of entries retained.
    pub fn restore(&self, restored: Vec<T>) -> usize {
        let mut entries = self.entries.write();
        entries.extend(restored);
        entries
            .make_contiguous()
            .sort_by_key(|entry| entry.audited_at());
        prune(&mut entries, self.retention, Utc::now());
        entries.len()
    }

    /// Drop entries older than the retention window at `now`
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        prune(&mut entries, self.retention, now)
    }

    /// Snapshot of retained entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<T> {
        self.entries.read().iter().cloned().collect()
    }

    /// Entries matching `predicate`
    #[must_use]
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.entries
            .read()
            .iter()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune<T: Audited>(
    entries: &mut VecDeque<T>,
    retention: chrono::Duration,
    now: DateTime<Utc>,
) -> usize {
    let cutoff = now - retention;
    let before = entries.len();
    entries.retain(|entry| entry.audited_at() >= cutoff);
    before - entries.len()
}

/// Kind of operator escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    RecoveryExhausted,
    CompensationFailed,
}

/// A failure needing manual intervention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: EscalationId,
    pub kind: EscalationKind,
    pub store_ids: Vec<StoreId>,
    pub inconsistency_ref: Option<InconsistencyId>,
    pub transaction_id: Option<TransactionId>,
    pub attempts: Vec<AttemptId>,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

impl Escalation {
    /// Recovery chain exhausted
    #[must_use]
    pub fn recovery_exhausted(
        store_id: StoreId,
        inconsistency_ref: Option<InconsistencyId>,
        attempts: Vec<AttemptId>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: EscalationId::new(),
            kind: EscalationKind::RecoveryExhausted,
            store_ids: vec![store_id],
            inconsistency_ref,
            transaction_id: None,
            attempts,
            detail: detail.into(),
            raised_at: Utc::now(),
        }
    }

    /// Compensation failed
    #[must_use]
    pub fn compensation_failed(
        transaction_id: TransactionId,
        store_ids: Vec<StoreId>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: EscalationId::new(),
            kind: EscalationKind::CompensationFailed,
            store_ids,
            inconsistency_ref: None,
            transaction_id: Some(transaction_id),
            attempts: Vec::new(),
            detail: detail.into(),
            raised_at: Utc::now(),
        }
    }
}

impl Escalation {
    /// Whether `other` reports the same failure as this escalation
    #[must_use]
    pub fn covers(&self, other: &Escalation) -> bool {
        self.kind == other.kind
            && self.inconsistency_ref == other.inconsistency_ref
            && self.transaction_id == other.transaction_id
            && self.store_ids == other.store_ids
    }
}

impl Audited for Escalation {
    fn audited_at(&self) -> DateTime<Utc> {
        self.raised_at
    }
}

/// Open escalations
#[derive(Debug, Default)]
pub struct Escalations {
    open: RwLock<Vec<Escalation>>,
}

impl Escalations {
    /// Record an escalation unless an open one already covers it
    ///
    /// Returns whether the escalation was added.
    pub fn raise(&self, escalation: Escalation) -> bool {
        let mut open = self.open.write();
        if open.iter().any(|existing| existing.covers(&escalation)) {
            return false;
        }
        open.push(escalation);
        true
    }

    /// Whether recovery of `inconsistency` already exhausted its chain
    /// and is waiting for an operator
    #[must_use]
    pub fn exhausted(&self, inconsistency: InconsistencyId) -> bool {
        self.open.read().iter().any(|escalation| {
            escalation.kind == EscalationKind::RecoveryExhausted
                && escalation.inconsistency_ref == Some(inconsistency)
        })
    }

    /// Mark an escalation resolved
    pub fn resolve(&self, id: EscalationId) -> Option<Escalation> {
        let mut open = self.open.write();
        let position = open.iter().position(|e| e.id == id)?;
        Some(open.remove(position))
    }

    /// Open escalations, oldest first
    #[must_use]
    pub fn open(&self) -> Vec<Escalation> {
        self.open.read().clone()
    }
}

/// A compensation the store could not perform itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReconciliation {
    pub transaction_id: TransactionId,
    pub store_id: StoreId,
    pub action: String,
    /// Entity left in doubt, when known
    pub entity: Option<EntityKey>,
    pub queued_at: DateTime<Utc>,
}

/// Compensations waiting for the detector and executor
#[derive(Debug, Default)]
pub struct ReconciliationQueue {
    pending: RwLock<Vec<PendingReconciliation>>,
}

impl ReconciliationQueue {
    /// Queue a hand-off
    pub fn push(&self, item: PendingReconciliation) {
        self.pending.write().push(item);
    }

    /// Pending hand-offs
    #[must_use]
    pub fn pending(&self) -> Vec<PendingReconciliation> {
        self.pending.read().clone()
    }

    /// Remove every hand-off for `entity`, returning how many were cleared
    pub fn settle(&self, entity: &EntityKey) -> usize {
        let mut pending = self.pending.write();
        let before = pending.len();
        pending.retain(|item| item.entity.as_ref() != Some(entity));
        before - pending.len()
    }

    /// Number of pending hand-offs
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Findings of one detection pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionPass {
    pub completed_at: DateTime<Utc>,
    pub inconsistencies: Vec<Inconsistency>,
}

/// Bounded history of detection passes
#[derive(Debug)]
pub struct InconsistencyHistory {
    capacity: usize,
    passes: RwLock<VecDeque<DetectionPass>>,
}

impl InconsistencyHistory {
    /// Keep at most `capacity` passes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            passes: RwLock::new(VecDeque::new()),
        }
    }

    /// Record a pass, evicting the oldest beyond capacity
    pub fn push(&self, pass: DetectionPass) {
        let mut passes = self.passes.write();
        passes.push_back(pass);
        while passes.len() > self.capacity {
            passes.pop_front();
        }
    }

    /// Replace the history, keeping the newest passes
    pub fn replace(&self, restored: Vec<DetectionPass>) {
        let mut passes = self.passes.write();
        passes.clear();
        let skip = restored.len().saturating_sub(self.capacity);
        passes.extend(restored.into_iter().skip(skip));
    }

    /// Most recent pass
    #[must_use]
    pub fn latest(&self) -> Option<DetectionPass> {
        self.passes.read().back().cloned()
    }

    /// All retained passes, oldest first
    #[must_use]
    pub fn passes(&self) -> Vec<DetectionPass> {
        self.passes.read().iter().cloned().collect()
    }
}
