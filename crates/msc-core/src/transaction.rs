//! Saga coordinator for multi-store writes
//!
//! A transaction is an ordered list of [`WriteStep`]s. Steps run forward in
//! order; when step `k` fails, steps `k-1..0` are compensated in reverse.
//!
//! - [`TransactionCoordinator::prepare`] validates every store before any write
//! - [`PreparedTransaction::cancel`] is the only way to cancel, so a transaction
//!   that started executing always runs to a terminal phase
//! - [`TransactionCoordinator::run`] drives the saga on its own task, so
//!   dropping the caller's future never strands completed steps
//! - stores without rollback hand the undo off to the reconciliation queue

use crate::audit::{AuditLog, Audited, Escalation, PendingReconciliation, ReconciliationQueue};
use crate::error::ConsistencyError;
use crate::executor::Collaborators;
use crate::ids::TransactionId;
use crate::strategy::resolve_store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use msc_breaker::{BreakerState, CallError, GuardedStore, StoreRegistry};
use msc_store::{EntityKey, EntityRecord, PrincipalId, StoreError, StoreId, StoreRole};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transaction phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionPhase {
    Preparing,
    Executing,
    Committed,
    Compensating,
    Compensated,
    Failed,
}

impl TransactionPhase {
    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Compensated | Self::Failed)
    }

    /// Stable name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        }
    }
}

/// Result of one compensating action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompensationOutcome {
    /// The forward write was undone
    Undone,
    /// Queued for the detector and executor
    Deferred,
    /// The undo itself failed
    Failed,
}

/// One entry of the compensating log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub store_id: StoreId,
    pub action: String,
    pub outcome: CompensationOutcome,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Audit record of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: TransactionId,
    /// Forward-path order
    pub participating_stores: Vec<StoreId>,
    pub phase: TransactionPhase,
    pub compensating_log: Vec<CompensationEntry>,
    /// Index of the step that failed
    pub failed_step: Option<usize>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransactionRecord {
    fn preparing(participating_stores: Vec<StoreId>) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            participating_stores,
            phase: TransactionPhase::Preparing,
            compensating_log: Vec::new(),
            failed_step: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self, phase: TransactionPhase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }

    /// Stores whose compensation failed
    #[must_use]
    pub fn failed_compensations(&self) -> Vec<StoreId> {
        self.compensating_log
            .iter()
            .filter(|entry| entry.outcome == CompensationOutcome::Failed)
            .map(|entry| entry.store_id.clone())
            .collect()
    }
}

impl Audited for TransactionRecord {
    fn audited_at(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.started_at)
    }
}

/// Forward action and its compensation
#[async_trait]
pub trait StepAction: Send + Sync + fmt::Debug {
    /// Short description for logs and the compensating log
    fn describe(&self) -> String;

    /// Perform the forward write
    async fn apply(&self, store: &GuardedStore) -> Result<(), CallError>;

    /// Undo a completed forward write
    async fn compensate(&self, store: &GuardedStore) -> Result<(), CallError>;

    /// Entity left in doubt when the undo is handed off
    fn reconcile_hint(&self) -> Option<EntityKey> {
        None
    }
}

/// Prior value captured by `apply`; `None` until the step ran
type Prior = Mutex<Option<Option<EntityRecord>>>;

async fn restore_prior(
    store: &GuardedStore,
    key: &EntityKey,
    prior: &Prior,
) -> Result<(), CallError> {
    let captured = prior.lock().clone();
    match captured {
        Some(Some(record)) => store.write(key, record).await,
        Some(None) => store.delete(key).await.map(|_| ()),
        None => Ok(()),
    }
}

#[derive(Debug)]
struct PutAction {
    key: EntityKey,
    record: EntityRecord,
    prior: Prior,
}

#[async_trait]
impl StepAction for PutAction {
    fn describe(&self) -> String {
        format!("put {}", self.key)
    }

    async fn apply(&self, store: &GuardedStore) -> Result<(), CallError> {
        let prior = store.read(&self.key).await?;
        *self.prior.lock() = Some(prior);
        store.write(&self.key, self.record.clone()).await
    }

    async fn compensate(&self, store: &GuardedStore) -> Result<(), CallError> {
        restore_prior(store, &self.key, &self.prior).await
    }

    fn reconcile_hint(&self) -> Option<EntityKey> {
        Some(self.key.clone())
    }
}

#[derive(Debug)]
struct DeleteAction {
    key: EntityKey,
    prior: Prior,
}

#[async_trait]
impl StepAction for DeleteAction {
    fn describe(&self) -> String {
        format!("delete {}", self.key)
    }

    async fn apply(&self, store: &GuardedStore) -> Result<(), CallError> {
        let prior = store.read(&self.key).await?;
        *self.prior.lock() = Some(prior);
        store.delete(&self.key).await.map(|_| ())
    }

    async fn compensate(&self, store: &GuardedStore) -> Result<(), CallError> {
        restore_prior(store, &self.key, &self.prior).await
    }

    fn reconcile_hint(&self) -> Option<EntityKey> {
        Some(self.key.clone())
    }
}

/// One forward step against one store
#[derive(Debug)]
pub struct WriteStep {
    pub store_id: StoreId,
    /// Principal the write is made for; selects analytics stores and gates identity writes
    pub principal: Option<PrincipalId>,
    action: Box<dyn StepAction>,
}

impl WriteStep {
    /// Write `record`, compensated by restoring or deleting the prior value
    #[must_use]
    pub fn put(store_id: impl Into<StoreId>, key: EntityKey, record: EntityRecord) -> Self {
        Self::custom(
            store_id,
            PutAction {
                key,
                record,
                prior: Mutex::new(None),
            },
        )
    }

    /// Delete `key`, compensated by restoring the prior value
    #[must_use]
    pub fn delete(store_id: impl Into<StoreId>, key: EntityKey) -> Self {
        Self::custom(
            store_id,
            DeleteAction {
                key,
                prior: Mutex::new(None),
            },
        )
    }

    /// Step with caller-supplied forward and compensating actions
    #[must_use]
    pub fn custom(store_id: impl Into<StoreId>, action: impl StepAction + 'static) -> Self {
        Self {
            store_id: store_id.into(),
            principal: None,
            action: Box::new(action),
        }
    }

    /// Write on behalf of `principal`
    #[inline]
    #[must_use]
    pub fn on_behalf_of(mut self, principal: PrincipalId) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Description of the forward action
    #[must_use]
    pub fn describe(&self) -> String {
        self.action.describe()
    }
}

/// Saga coordinator
///
/// Clones share the audit log, the reconciliation queue and the
/// unacknowledged set.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    registry: Arc<StoreRegistry>,
    collaborators: Collaborators,
    reconciliations: Arc<ReconciliationQueue>,
    audit: Arc<AuditLog<TransactionRecord>>,
    unacknowledged: Arc<DashMap<TransactionId, TransactionRecord>>,
}

impl TransactionCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        registry: Arc<StoreRegistry>,
        collaborators: Collaborators,
        reconciliations: Arc<ReconciliationQueue>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            collaborators,
            reconciliations,
            audit: Arc::new(AuditLog::new(retention)),
            unacknowledged: Arc::new(DashMap::new()),
        }
    }

    /// Terminal transactions retained for audit
    #[inline]
    #[must_use]
    pub fn audit(&self) -> &AuditLog<TransactionRecord> {
        &self.audit
    }

    /// Reload transaction records persisted by an earlier run into the audit log
    pub fn restore_audit(&self, records: Vec<TransactionRecord>) -> usize {
        self.audit.restore(records)
    }

    /// Compensations handed off for later repair
    #[inline]
    #[must_use]
    pub fn reconciliations(&self) -> &Arc<ReconciliationQueue> {
        &self.reconciliations
    }

    /// Compensated or failed transactions not yet acknowledged
    #[must_use]
    pub fn unacknowledged(&self) -> Vec<TransactionRecord> {
        let mut records: Vec<_> = self
            .unacknowledged
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.transaction_id);
        records
    }

    /// Archive a compensated or failed transaction
    ///
    /// Also resolves the compensation escalation raised for it.
    pub fn acknowledge(&self, id: TransactionId) -> Option<TransactionRecord> {
        let (_, record) = self.unacknowledged.remove(&id)?;
        for escalation in self.collaborators.escalations.open() {
            if escalation.transaction_id == Some(id) {
                self.collaborators.escalations.resolve(escalation.id);
            }
        }
        info!(transaction = %id, phase = record.phase.as_str(), "transaction acknowledged");
        Some(record)
    }

    /// Prepare and execute `steps`
    ///
    /// Execution runs on a spawned task. If the returned future is dropped
    /// the saga still reaches a terminal phase, compensating on failure.
    pub async fn run(&self, steps: Vec<WriteStep>) -> Result<TransactionRecord, ConsistencyError> {
        let prepared = self.prepare(steps).await?;
        let transaction_id = prepared.transaction_id();
        prepared
            .spawn()
            .await
            .map_err(|err| ConsistencyError::TransactionInterrupted {
                transaction_id,
                reason: err.to_string(),
            })
    }

    /// Validate every participating store
    ///
    /// Fails fast with `StoreUnavailable` when any breaker is open; nothing is
    /// written before every store has been checked.
    pub async fn prepare(&self, steps: Vec<WriteStep>) -> Result<PreparedTransaction, ConsistencyError> {
        if steps.is_empty() {
            return Err(ConsistencyError::config("transaction has no steps"));
        }

        let mut resolved = Vec::with_capacity(steps.len());
        for step in steps {
            let store = resolve_store(&self.registry, &step.store_id, step.principal.as_ref())?;
            if store.breaker().state() == BreakerState::Open {
                debug!(store = %store.store_id(), "transaction rejected, breaker open");
                return Err(ConsistencyError::StoreUnavailable {
                    store_id: store.store_id().clone(),
                });
            }
            if store.role() == StoreRole::Identity {
                if let Some(principal) = &step.principal {
                    if !self.collaborators.gate.credential_valid(principal).await {
                        return Err(ConsistencyError::Unauthenticated {
                            principal: principal.clone(),
                        });
                    }
                }
            }
            resolved.push((store, step));
        }

        let record = TransactionRecord::preparing(
            resolved
                .iter()
                .map(|(store, _)| store.store_id().clone())
                .collect(),
        );
        debug!(transaction = %record.transaction_id, stores = ?record.participating_stores, "transaction prepared");
        Ok(PreparedTransaction {
            coordinator: self.clone(),
            record,
            steps: resolved,
        })
    }

    async fn finalize(&self, record: TransactionRecord) -> TransactionRecord {
        metrics::counter!("msc_transactions_total", "phase" => record.phase.as_str()).increment(1);

        let failed = record.failed_compensations();
        if !failed.is_empty() {
            let detail = ConsistencyError::CompensationFailed {
                transaction_id: record.transaction_id,
                failed: failed.clone(),
            }
            .to_string();
            let escalation = Escalation::compensation_failed(record.transaction_id, failed, detail);
            if self.collaborators.escalations.raise(escalation.clone()) {
                self.collaborators.alerts.alert(&escalation).await;
            }
        }
        if record.phase != TransactionPhase::Committed {
            self.unacknowledged
                .insert(record.transaction_id, record.clone());
        }

        self.audit.append(record.clone());
        if let Err(err) = self.collaborators.state.record_transaction(&record).await {
            warn!(transaction = %record.transaction_id, %err, "transaction record not persisted");
        }
        record
    }

    async fn compensate(
        &self,
        transaction_id: TransactionId,
        store: &GuardedStore,
        step: &WriteStep,
    ) -> CompensationEntry {
        let action = format!("undo {}", step.describe());
        let mut entry = CompensationEntry {
            store_id: store.store_id().clone(),
            action,
            outcome: CompensationOutcome::Undone,
            error: None,
            at: Utc::now(),
        };

        let result = if store.capabilities().rollback {
            step.action.compensate(store).await
        } else {
            Err(CallError::Store(StoreError::unsupported(store.store_id(), "rollback")))
        };

        match result {
            Ok(()) => {}
            Err(CallError::Store(StoreError::Unsupported { .. })) => {
                entry.outcome = CompensationOutcome::Deferred;
                self.reconciliations.push(PendingReconciliation {
                    transaction_id,
                    store_id: entry.store_id.clone(),
                    action: entry.action.clone(),
                    entity: step.action.reconcile_hint(),
                    queued_at: entry.at,
                });
                info!(transaction = %transaction_id, store = %entry.store_id, "compensation handed off for reconciliation");
            }
            Err(err) => {
                entry.outcome = CompensationOutcome::Failed;
                entry.error = Some(err.to_string());
                error!(transaction = %transaction_id, store = %entry.store_id, %err, "compensation failed");
            }
        }
        entry
    }
}

/// A validated transaction that has not written anything yet
#[derive(Debug)]
pub struct PreparedTransaction {
    coordinator: TransactionCoordinator,
    record: TransactionRecord,
    steps: Vec<(Arc<GuardedStore>, WriteStep)>,
}

impl PreparedTransaction {
    /// Transaction id
    #[inline]
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.record.transaction_id
    }

    /// Participating stores in forward order
    #[inline]
    #[must_use]
    pub fn participating_stores(&self) -> &[StoreId] {
        &self.record.participating_stores
    }

    /// Abandon the transaction before any write
    pub async fn cancel(self) -> TransactionRecord {
        let mut record = self.record;
        record.error = Some(ConsistencyError::Cancelled.to_string());
        record.finish(TransactionPhase::Failed);
        info!(transaction = %record.transaction_id, "transaction cancelled");
        self.coordinator.finalize(record).await
    }

    /// Execute on a new task that outlives the caller
    pub fn spawn(self) -> JoinHandle<TransactionRecord> {
        tokio::spawn(self.execute())
    }

    /// Run every step, compensating on failure
    pub async fn execute(self) -> TransactionRecord {
        let Self {
            coordinator,
            mut record,
            steps,
        } = self;
        record.phase = TransactionPhase::Executing;

        let mut completed = 0;
        for (index, (store, step)) in steps.iter().enumerate() {
            match step.action.apply(store).await {
                Ok(()) => completed = index + 1,
                Err(err) => {
                    warn!(
                        transaction = %record.transaction_id,
                        step = index,
                        store = %store.store_id(),
                        %err,
                        "transaction step failed"
                    );
                    record.failed_step = Some(index);
                    record.error = Some(ConsistencyError::from(err).to_string());
                    break;
                }
            }
        }

        if record.failed_step.is_none() {
            record.finish(TransactionPhase::Committed);
            debug!(transaction = %record.transaction_id, "transaction committed");
            return coordinator.finalize(record).await;
        }

        record.phase = TransactionPhase::Compensating;
        for (store, step) in steps[..completed].iter().rev() {
            let entry = coordinator
                .compensate(record.transaction_id, store, step)
                .await;
            record.compensating_log.push(entry);
        }

        let phase = if record.failed_compensations().is_empty() {
            TransactionPhase::Compensated
        } else {
            TransactionPhase::Failed
        };
        record.finish(phase);
        info!(
            transaction = %record.transaction_id,
            phase = phase.as_str(),
            compensations = record.compensating_log.len(),
            "transaction rolled back"
        );
        coordinator.finalize(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Escalations;
    use crate::executor::{AllowAll, TracingAlertSink};
    use crate::persistence::StateStore;
    use crate::strategy::NoBackups;
    use msc_store::{EntityType, IdentityStore, MemoryTable, MetadataStore};
    use pretty_assertions::assert_eq;

    struct Fixture {
        identity: Arc<MemoryTable>,
        metadata: Arc<MemoryTable>,
        registry: Arc<StoreRegistry>,
        coordinator: TransactionCoordinator,
        escalations: Arc<Escalations>,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryTable::new());
        let metadata = Arc::new(MemoryTable::new());
        let registry = Arc::new(
            StoreRegistry::builder()
                .store(Arc::new(IdentityStore::with_table("identity", 0, Arc::clone(&identity))))
                .store(Arc::new(MetadataStore::with_table("metadata", 1, Arc::clone(&metadata))))
                .build()
                .unwrap(),
        );
        let escalations = Arc::new(Escalations::default());
        let collaborators = Collaborators {
            catalog: Arc::new(NoBackups),
            gate: Arc::new(AllowAll),
            alerts: Arc::new(TracingAlertSink),
            escalations: Arc::clone(&escalations),
            state: Arc::new(StateStore::new(Arc::clone(&registry))),
        };
        Fixture {
            identity,
            metadata,
            coordinator: TransactionCoordinator::new(
                Arc::clone(&registry),
                collaborators,
                Arc::new(ReconciliationQueue::default()),
                chrono::Duration::days(90),
            ),
            registry,
            escalations,
        }
    }

    fn principal_key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::principal(), id)
    }

    #[derive(Debug)]
    struct Boom;

    #[async_trait]
    impl StepAction for Boom {
        fn describe(&self) -> String {
            "boom".to_string()
        }

        async fn apply(&self, store: &GuardedStore) -> Result<(), CallError> {
            Err(CallError::Store(StoreError::io(store.store_id(), "disk full")))
        }

        async fn compensate(&self, _store: &GuardedStore) -> Result<(), CallError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BrokenUndo;

    #[async_trait]
    impl StepAction for BrokenUndo {
        fn describe(&self) -> String {
            "counter bump".to_string()
        }

        async fn apply(&self, _store: &GuardedStore) -> Result<(), CallError> {
            Ok(())
        }

        async fn compensate(&self, store: &GuardedStore) -> Result<(), CallError> {
            Err(CallError::Store(StoreError::io(store.store_id(), "connection reset")))
        }
    }

    #[derive(Debug)]
    struct NoUndo;

    #[async_trait]
    impl StepAction for NoUndo {
        fn describe(&self) -> String {
            "append event".to_string()
        }

        async fn apply(&self, _store: &GuardedStore) -> Result<(), CallError> {
            Ok(())
        }

        async fn compensate(&self, store: &GuardedStore) -> Result<(), CallError> {
            Err(CallError::Store(StoreError::unsupported(store.store_id(), "undo append")))
        }

        fn reconcile_hint(&self) -> Option<EntityKey> {
            Some(EntityKey::new(EntityType::execution(), "e1"))
        }
    }

    #[tokio::test]
    async fn all_steps_succeed_commits() {
        let fx = fixture();
        let record = fx
            .coordinator
            .run(vec![
                WriteStep::put("identity", principal_key("p1"), EntityRecord::placeholder()),
                WriteStep::put("metadata", principal_key("p1"), EntityRecord::placeholder()),
            ])
            .await
            .unwrap();

        assert_eq!(record.phase, TransactionPhase::Committed);
        assert_eq!(
            record.participating_stores,
            vec![StoreId::new("identity"), StoreId::new("metadata")]
        );
        assert!(record.compensating_log.is_empty());
        assert_eq!(fx.coordinator.audit().len(), 1);
        assert!(fx.coordinator.unacknowledged().is_empty());
    }

    #[tokio::test]
    async fn failure_compensates_in_reverse() {
        let fx = fixture();
        let prior = EntityRecord::new(serde_json::json!({"name": "before"}));
        fx.metadata.write(&principal_key("p1"), prior.clone());

        let record = fx
            .coordinator
            .run(vec![
                WriteStep::put("identity", principal_key("p1"), EntityRecord::placeholder()),
                WriteStep::put(
                    "metadata",
                    principal_key("p1"),
                    EntityRecord::new(serde_json::json!({"name": "after"})),
                ),
                WriteStep::custom("metadata", Boom),
            ])
            .await
            .unwrap();

        assert_eq!(record.phase, TransactionPhase::Compensated);
        assert_eq!(record.failed_step, Some(2));
        let undone: Vec<_> = record
            .compensating_log
            .iter()
            .map(|entry| (entry.store_id.as_str().to_string(), entry.outcome))
            .collect();
        assert_eq!(
            undone,
            vec![
                ("metadata".to_string(), CompensationOutcome::Undone),
                ("identity".to_string(), CompensationOutcome::Undone),
            ]
        );

        let restored = fx
            .metadata
            .read(&StoreId::new("metadata"), &principal_key("p1"))
            .unwrap()
            .unwrap();
        assert!(restored.same_content(&prior));
        assert!(fx
            .identity
            .read(&StoreId::new("identity"), &principal_key("p1"))
            .unwrap()
            .is_none());
        assert_eq!(fx.coordinator.unacknowledged().len(), 1);
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_writes() {
        let fx = fixture();
        let metadata = fx.registry.get(&StoreId::new("metadata")).unwrap();
        metadata.breaker().force_open(tokio::time::Instant::now());

        let err = fx
            .coordinator
            .run(vec![
                WriteStep::put("identity", principal_key("p1"), EntityRecord::placeholder()),
                WriteStep::put("metadata", principal_key("p1"), EntityRecord::placeholder()),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ConsistencyError::StoreUnavailable { .. }));
        assert!(err.is_retryable());
        assert!(fx.identity.is_empty());
    }

    #[tokio::test]
    async fn unsupported_undo_is_deferred() {
        let fx = fixture();
        let record = fx
            .coordinator
            .run(vec![
                WriteStep::custom("metadata", NoUndo),
                WriteStep::custom("identity", Boom),
            ])
            .await
            .unwrap();

        assert_eq!(record.phase, TransactionPhase::Compensated);
        assert_eq!(record.compensating_log[0].outcome, CompensationOutcome::Deferred);
        let pending = fx.coordinator.reconciliations().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity, Some(EntityKey::new(EntityType::execution(), "e1")));
    }

    #[tokio::test]
    async fn failed_compensation_escalates() {
        let fx = fixture();
        let record = fx
            .coordinator
            .run(vec![
                WriteStep::custom("metadata", BrokenUndo),
                WriteStep::custom("identity", Boom),
            ])
            .await
            .unwrap();

        assert_eq!(record.phase, TransactionPhase::Failed);
        assert_eq!(record.failed_compensations(), vec![StoreId::new("metadata")]);
        let open = fx.escalations.open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].transaction_id, Some(record.transaction_id));

        assert!(fx.coordinator.acknowledge(record.transaction_id).is_some());
        assert!(fx.escalations.open().is_empty());
    }

    #[tokio::test]
    async fn cancel_before_execute_writes_nothing() {
        let fx = fixture();
        let prepared = fx
            .coordinator
            .prepare(vec![WriteStep::put(
                "metadata",
                principal_key("p1"),
                EntityRecord::placeholder(),
            )])
            .await
            .unwrap();
        let record = prepared.cancel().await;

        assert_eq!(record.phase, TransactionPhase::Failed);
        assert_eq!(record.error.as_deref(), Some("transaction cancelled"));
        assert!(fx.metadata.ids(&EntityType::principal()).is_empty());
        assert!(fx.coordinator.acknowledge(record.transaction_id).is_some());
    }

    #[derive(Debug)]
    struct Stalls(std::time::Duration);

    #[async_trait]
    impl StepAction for Stalls {
        fn describe(&self) -> String {
            "slow write".to_string()
        }

        async fn apply(&self, store: &GuardedStore) -> Result<(), CallError> {
            tokio::time::sleep(self.0).await;
            Err(CallError::Store(StoreError::io(store.store_id(), "write stalled")))
        }

        async fn compensate(&self, _store: &GuardedStore) -> Result<(), CallError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_still_compensates() {
        let fx = fixture();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            fx.coordinator.run(vec![
                WriteStep::put("identity", principal_key("p1"), EntityRecord::placeholder()),
                WriteStep::custom("metadata", Stalls(std::time::Duration::from_millis(500))),
            ]),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(fx.identity.ids(&EntityType::principal()).is_empty());
        let records = fx.coordinator.audit().entries();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].phase, TransactionPhase::Compensated);
        assert_eq!(records[0].failed_step, Some(1));
        assert_eq!(fx.coordinator.unacknowledged().len(), 1);
    }

    #[tokio::test]
    async fn empty_transaction_is_rejected() {
        let fx = fixture();
        let err = fx.coordinator.prepare(Vec::new()).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::Config(_)));
    }
}
