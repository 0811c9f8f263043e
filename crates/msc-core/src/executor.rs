//! Compensating transaction executor
//!
//! Carries out recovery strategies against breaker-guarded stores:
//! - every write is keyed by entity, so re-running an attempt is idempotent
//! - a failed attempt is recorded and the next strategy starts fresh
//! - a partial success is retried a bounded number of times, then waits for an operator
//! - exhausting the chain raises an escalation; nothing loops
//!
//! Attempts against one store instance are serialized by a per-store mutex.

use crate::audit::{AuditLog, Audited, Escalation, Escalations};
use crate::config::{EntityTypeSpec, Ownership, RecoverySettings};
use crate::error::ConsistencyError;
use crate::ids::{AttemptId, InconsistencyId};
use crate::persistence::StateStore;
use crate::strategy::{
    resolve_store, BackupCatalog, BackupInfo, DataLoss, PlannedStrategy, RecoveryPlan,
    RecoveryTarget, Strategy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use msc_breaker::{CallError, GuardedStore, StoreRegistry};
use msc_store::{
    EntityKey, EntityRecord, EntityType, PrincipalId, Provenance, StoreError, StoreId, StoreRole,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Attempt status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
    PartialSuccess,
}

/// One execution of one strategy against one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: AttemptId,
    /// `None` for whole-store repairs
    pub inconsistency_ref: Option<InconsistencyId>,
    pub target: RecoveryTarget,
    pub strategy: Strategy,
    pub status: AttemptStatus,
    pub data_loss_estimate: DataLoss,
    pub source_store: Option<StoreId>,
    pub backup: Option<BackupInfo>,
    /// 1 for the first try, incremented on automatic retry
    pub attempt: u32,
    pub retry_of: Option<AttemptId>,
    pub records_total: u64,
    pub records_recovered: u64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecoveryAttempt {
    /// Fresh pending attempt for `planned`
    #[must_use]
    pub fn pending(
        inconsistency_ref: Option<InconsistencyId>,
        target: RecoveryTarget,
        planned: &PlannedStrategy,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            inconsistency_ref,
            target,
            strategy: planned.strategy,
            status: AttemptStatus::Pending,
            data_loss_estimate: planned.data_loss_estimate,
            source_store: planned.source.clone(),
            backup: planned.backup.clone(),
            attempt: 1,
            retry_of: None,
            records_total: 0,
            records_recovered: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Fresh attempt retrying this one
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            id: AttemptId::new(),
            attempt: self.attempt + 1,
            retry_of: Some(self.id),
            status: AttemptStatus::Pending,
            records_total: 0,
            records_recovered: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            ..self.clone()
        }
    }

    /// Whether the status has left `Pending`
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status != AttemptStatus::Pending
    }

    fn finish(mut self, status: AttemptStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self
    }
}

impl Audited for RecoveryAttempt {
    fn audited_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }
}

/// How a recovery chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    NeedsAcknowledgement,
    Exhausted,
}

/// All attempts made for one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub inconsistency_ref: Option<InconsistencyId>,
    pub target: RecoveryTarget,
    pub outcome: RecoveryOutcome,
    pub attempts: Vec<RecoveryAttempt>,
}

/// Operator alert delivery
#[async_trait]
pub trait AlertSink: Send + Sync + fmt::Debug {
    /// Deliver an escalation
    async fn alert(&self, escalation: &Escalation);
}

/// Logs escalations at error level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, escalation: &Escalation) {
        error!(
            escalation = %escalation.id,
            kind = ?escalation.kind,
            stores = ?escalation.store_ids,
            detail = %escalation.detail,
            "operator intervention required"
        );
    }
}

/// External credential signal consulted before identity writes
#[async_trait]
pub trait CredentialGate: Send + Sync + fmt::Debug {
    /// Whether `principal`'s credential is currently valid
    async fn credential_valid(&self, principal: &PrincipalId) -> bool;
}

/// Accepts every principal
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl CredentialGate for AllowAll {
    async fn credential_valid(&self, _principal: &PrincipalId) -> bool {
        true
    }
}

/// Collaborators shared by the executor and the transaction coordinator
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn BackupCatalog>,
    pub gate: Arc<dyn CredentialGate>,
    pub alerts: Arc<dyn AlertSink>,
    pub escalations: Arc<Escalations>,
    pub state: Arc<StateStore>,
}

/// Failure of one strategy step
#[derive(Debug)]
struct StepFailure(String);

macro_rules! step_failure_from {
    ($($err:ty),+ $(,)?) => {
        $(impl From<$err> for StepFailure {
            fn from(err: $err) -> Self {
                Self(err.to_string())
            }
        })+
    };
}

step_failure_from!(StoreError, CallError, ConsistencyError);

struct Progress {
    total: u64,
    recovered: u64,
}

impl Progress {
    fn complete(count: u64) -> Self {
        Self {
            total: count,
            recovered: count,
        }
    }
}

/// Strategy executor
#[derive(Debug)]
pub struct RecoveryExecutor {
    registry: Arc<StoreRegistry>,
    specs: BTreeMap<EntityType, EntityTypeSpec>,
    settings: RecoverySettings,
    collaborators: Collaborators,
    audit: AuditLog<RecoveryAttempt>,
    locks: DashMap<StoreId, Arc<Mutex<()>>>,
    awaiting_ack: DashMap<AttemptId, RecoveryAttempt>,
}

impl RecoveryExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(
        registry: Arc<StoreRegistry>,
        specs: Vec<EntityTypeSpec>,
        settings: RecoverySettings,
        collaborators: Collaborators,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            specs: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
            settings,
            collaborators,
            audit: AuditLog::new(retention),
            locks: DashMap::new(),
            awaiting_ack: DashMap::new(),
        }
    }

    /// Terminal attempts retained for audit
    #[inline]
    #[must_use]
    pub fn audit(&self) -> &AuditLog<RecoveryAttempt> {
        &self.audit
    }

    /// Reload attempts persisted by an earlier run into the audit log
    pub fn restore_audit(&self, attempts: Vec<RecoveryAttempt>) -> usize {
        self.audit.restore(attempts)
    }

    /// Partial successes waiting for an operator
    #[must_use]
    pub fn awaiting_acknowledgement(&self) -> Vec<RecoveryAttempt> {
        let mut attempts: Vec<_> = self
            .awaiting_ack
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        attempts.sort_by_key(|attempt| attempt.id);
        attempts
    }

    /// Clear a partial success an operator has reviewed
    pub fn acknowledge(&self, id: AttemptId) -> Option<RecoveryAttempt> {
        let (_, attempt) = self.awaiting_ack.remove(&id)?;
        info!(attempt = %id, target = %attempt.target, "partial recovery acknowledged");
        Some(attempt)
    }

    /// Drive `plan` through its fallback chain
    pub async fn run(&self, plan: &RecoveryPlan) -> RecoveryReport {
        let mut attempts = Vec::new();

        for planned in &plan.strategies {
            let mut attempt = self
                .execute(RecoveryAttempt::pending(
                    plan.inconsistency_ref,
                    plan.target.clone(),
                    planned,
                ))
                .await;
            let mut retries = 0;
            while attempt.status == AttemptStatus::PartialSuccess
                && retries < self.settings.partial_retry_limit
            {
                retries += 1;
                let retry = attempt.retry();
                attempts.push(attempt);
                attempt = self.execute(retry).await;
            }

            let status = attempt.status;
            if status == AttemptStatus::PartialSuccess {
                warn!(attempt = %attempt.id, target = %plan.target, "partial recovery needs acknowledgement");
                self.awaiting_ack.insert(attempt.id, attempt.clone());
            }
            attempts.push(attempt);

            match status {
                AttemptStatus::Succeeded => {
                    return Self::report(plan, RecoveryOutcome::Recovered, attempts);
                }
                AttemptStatus::PartialSuccess => {
                    return Self::report(plan, RecoveryOutcome::NeedsAcknowledgement, attempts);
                }
                AttemptStatus::Failed | AttemptStatus::Pending => {}
            }
        }

        let escalation = Escalation::recovery_exhausted(
            plan.target.store_id.clone(),
            plan.inconsistency_ref,
            attempts.iter().map(|attempt| attempt.id).collect(),
            ConsistencyError::RecoveryExhausted {
                target: plan.target.to_string(),
                attempts: attempts.len(),
            }
            .to_string(),
        );
        if self.collaborators.escalations.raise(escalation.clone()) {
            self.collaborators.alerts.alert(&escalation).await;
            metrics::counter!("msc_recovery_exhausted_total").increment(1);
        } else {
            debug!(target = %plan.target, "recovery exhaustion already escalated");
        }
        Self::report(plan, RecoveryOutcome::Exhausted, attempts)
    }

    fn report(
        plan: &RecoveryPlan,
        outcome: RecoveryOutcome,
        attempts: Vec<RecoveryAttempt>,
    ) -> RecoveryReport {
        RecoveryReport {
            inconsistency_ref: plan.inconsistency_ref,
            target: plan.target.clone(),
            outcome,
            attempts,
        }
    }

    /// Execute one attempt to a terminal status
    pub async fn execute(&self, attempt: RecoveryAttempt) -> RecoveryAttempt {
        if attempt.is_terminal() {
            return attempt;
        }
        let lock = self.store_lock(&attempt.target.store_id);
        let _guard = lock.lock().await;

        debug!(attempt = %attempt.id, target = %attempt.target, strategy = %attempt.strategy, "executing recovery attempt");
        let finished = match self.apply(&attempt).await {
            Ok(progress) => {
                let status = if progress.recovered < progress.total {
                    AttemptStatus::PartialSuccess
                } else {
                    AttemptStatus::Succeeded
                };
                let mut done = attempt.finish(status, None);
                done.records_total = progress.total;
                done.records_recovered = progress.recovered;
                done
            }
            Err(StepFailure(reason)) => attempt.finish(AttemptStatus::Failed, Some(reason)),
        };

        match finished.status {
            AttemptStatus::Succeeded => info!(
                attempt = %finished.id,
                target = %finished.target,
                strategy = %finished.strategy,
                records = finished.records_recovered,
                "recovery attempt succeeded"
            ),
            AttemptStatus::PartialSuccess => warn!(
                attempt = %finished.id,
                target = %finished.target,
                strategy = %finished.strategy,
                recovered = finished.records_recovered,
                total = finished.records_total,
                "recovery attempt partially succeeded"
            ),
            _ => warn!(
                attempt = %finished.id,
                target = %finished.target,
                strategy = %finished.strategy,
                error = finished.error.as_deref().unwrap_or_default(),
                "recovery attempt failed"
            ),
        }
        metrics::counter!(
            "msc_recovery_attempts_total",
            "strategy" => finished.strategy.as_str(),
            "status" => format!("{:?}", finished.status)
        )
        .increment(1);

        self.audit.append(finished.clone());
        if let Err(err) = self.collaborators.state.record_attempt(&finished).await {
            warn!(attempt = %finished.id, %err, "recovery attempt not persisted");
        }
        finished
    }

    fn store_lock(&self, store_id: &StoreId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(store_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn resolve(
        &self,
        store_id: &StoreId,
        principal: Option<&PrincipalId>,
    ) -> Result<Arc<GuardedStore>, StepFailure> {
        Ok(resolve_store(&self.registry, store_id, principal)?)
    }

    async fn apply(&self, attempt: &RecoveryAttempt) -> Result<Progress, StepFailure> {
        let target = self.resolve(&attempt.target.store_id, attempt.target.principal.as_ref())?;
        self.check_credentials(&target, attempt).await?;

        match (attempt.strategy, &attempt.target.entity) {
            (Strategy::RebuildFromAuthoritative, Some(key)) => self.rebuild_entity(attempt, &target, key).await,
            (Strategy::RebuildFromAuthoritative, None) => self.rebuild_store(attempt, &target).await,
            (Strategy::RestoreFromBackup, scope) => self.restore(attempt, &target, scope.as_ref()).await,
            (Strategy::RepairInPlace, scope) => Self::repair(&target, scope.as_ref()).await,
            (Strategy::RecreateClean, Some(key)) => Self::recreate_entity(&target, key).await,
            (Strategy::RecreateClean, None) => {
                target.recreate().await?;
                Ok(Progress::complete(0))
            }
        }
    }

    async fn check_credentials(
        &self,
        target: &GuardedStore,
        attempt: &RecoveryAttempt,
    ) -> Result<(), StepFailure> {
        if target.role() != StoreRole::Identity {
            return Ok(());
        }
        let Some(principal) = &attempt.target.principal else {
            return Ok(());
        };
        if self.collaborators.gate.credential_valid(principal).await {
            Ok(())
        } else {
            Err(ConsistencyError::Unauthenticated {
                principal: principal.clone(),
            }
            .into())
        }
    }

    async fn rebuild_entity(
        &self,
        attempt: &RecoveryAttempt,
        target: &GuardedStore,
        key: &EntityKey,
    ) -> Result<Progress, StepFailure> {
        let source_id = attempt
            .source_store
            .as_ref()
            .ok_or_else(|| StepFailure("rebuild without a source store".to_string()))?;
        let source = self.resolve(source_id, attempt.target.principal.as_ref())?;
        let record = source
            .read(key)
            .await?
            .ok_or_else(|| StepFailure(format!("{source_id} no longer holds {key}")))?;

        if let Some(existing) = target.read(key).await? {
            if existing.same_content(&record) {
                debug!(%key, target = %target.store_id(), "target already matches source");
                return Ok(Progress::complete(1));
            }
        }
        let record = record.with_provenance(Provenance::recovery(
            Some(source_id.clone()),
            Strategy::RebuildFromAuthoritative.as_str(),
        ));
        target.write(key, record).await?;
        Ok(Progress::complete(1))
    }

    /// Copy every entity the source holds for the target's scope
    async fn rebuild_store(
        &self,
        attempt: &RecoveryAttempt,
        target: &GuardedStore,
    ) -> Result<Progress, StepFailure> {
        let source_id = attempt
            .source_store
            .as_ref()
            .ok_or_else(|| StepFailure("rebuild without a source store".to_string()))?;
        let source = self.resolve(source_id, None)?;
        let scope = target.descriptor().principal_scope.clone();

        let mut progress = Progress::complete(0);
        for spec in self.specs.values() {
            if !spec.covers(target.role()) || !spec.sources_for(target.role()).contains(&source.role()) {
                continue;
            }
            for id in source.list(&spec.name).await? {
                let key = EntityKey::new(spec.name.clone(), id);
                let Some(record) = source.read(&key).await? else {
                    continue;
                };
                if !in_scope(spec, &key, &record, scope.as_ref()) {
                    continue;
                }
                progress.total += 1;
                let record = record.with_provenance(Provenance::recovery(
                    Some(source_id.clone()),
                    Strategy::RebuildFromAuthoritative.as_str(),
                ));
                target.write(&key, record).await?;
                progress.recovered += 1;
            }
        }
        Ok(progress)
    }

    async fn restore(
        &self,
        attempt: &RecoveryAttempt,
        target: &GuardedStore,
        scope: Option<&EntityKey>,
    ) -> Result<Progress, StepFailure> {
        let backup = attempt
            .backup
            .as_ref()
            .ok_or_else(|| StepFailure("restore without a backup".to_string()))?;
        let records = self
            .collaborators
            .catalog
            .load(backup, scope)
            .await
            .map_err(|err| StepFailure(format!("backup {}: {err}", backup.backup_id)))?;

        let records: Vec<_> = records
            .into_iter()
            .filter(|(key, _)| scope.map_or(true, |wanted| wanted == key))
            .collect();
        if scope.is_some() && records.is_empty() {
            return Err(StepFailure(format!("backup {} does not hold the entity", backup.backup_id)));
        }
        if scope.is_none() {
            target.recreate().await?;
        }

        let count = records.len() as u64;
        for (key, record) in records {
            let record = record.with_provenance(Provenance::recovery(
                None,
                Strategy::RestoreFromBackup.as_str(),
            ));
            target.write(&key, record).await?;
        }
        Ok(Progress::complete(count))
    }

    /// Give one entity an empty, recovery-marked record
    ///
    /// Identity records carry credentials and are never recreated empty.
    async fn recreate_entity(target: &GuardedStore, key: &EntityKey) -> Result<Progress, StepFailure> {
        if target.role() == StoreRole::Identity {
            return Err(StepFailure(format!(
                "{key} cannot be recreated empty in identity store {}",
                target.store_id()
            )));
        }
        target.initialize().await?;
        let empty = EntityRecord::placeholder()
            .with_provenance(Provenance::recovery(None, Strategy::RecreateClean.as_str()));
        target.write(key, empty).await?;
        Ok(Progress::complete(1))
    }

    /// Drop unreadable rows in place, leaving every readable row untouched
    ///
    /// Scoped to one entity, only that row is rewritten or removed. A removed
    /// row fails the step so the chain moves on to a strategy that can
    /// bring the entity back.
    async fn repair(target: &GuardedStore, scope: Option<&EntityKey>) -> Result<Progress, StepFailure> {
        let extraction = target.extract().await?;
        let Some(key) = scope else {
            let total = (extraction.records.len() + extraction.skipped.len()) as u64;
            for key in &extraction.skipped {
                target.delete(key).await?;
            }
            if !extraction.skipped.is_empty() {
                warn!(store = %target.store_id(), skipped = ?extraction.skipped, "unreadable records dropped by repair");
            }
            return Ok(Progress {
                total,
                recovered: extraction.records.len() as u64,
            });
        };

        if let Some((_, record)) = extraction.records.into_iter().find(|(k, _)| k == key) {
            target.write(key, record).await?;
            return Ok(Progress::complete(1));
        }
        if extraction.skipped.contains(key) {
            target.delete(key).await?;
            warn!(store = %target.store_id(), %key, "unreadable record dropped by repair");
            return Err(StepFailure(format!("{key} was unreadable in {} and was removed", target.store_id())));
        }
        Err(StepFailure(format!("{key} not found in {}", target.store_id())))
    }
}

/// Whether `record` belongs to a store scoped to `principal`
fn in_scope(
    spec: &EntityTypeSpec,
    key: &EntityKey,
    record: &EntityRecord,
    principal: Option<&PrincipalId>,
) -> bool {
    let Some(principal) = principal else {
        return true;
    };
    match &spec.owner {
        Ownership::SelfPrincipal => key.id.as_str() == principal.as_str(),
        Ownership::Field(field) => {
            record.data.get(field).and_then(|v| v.as_str()) == Some(principal.as_str())
        }
        Ownership::Unscoped => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::EscalationKind;
    use crate::strategy::NoBackups;
    use msc_store::{AnalyticsStore, IdentityStore, MemoryTable, MetadataStore, StoreAdapter};
    use pretty_assertions::assert_eq;

    struct Fixture {
        metadata: Arc<MemoryTable>,
        analytics: Arc<MemoryTable>,
        executor: RecoveryExecutor,
        escalations: Arc<Escalations>,
    }

    #[derive(Debug)]
    struct DenyAll;

    #[async_trait]
    impl CredentialGate for DenyAll {
        async fn credential_valid(&self, _principal: &PrincipalId) -> bool {
            false
        }
    }

    fn fixture_with_gate(gate: Arc<dyn CredentialGate>) -> Fixture {
        let metadata = Arc::new(MemoryTable::new());
        let analytics = Arc::new(MemoryTable::uninitialized());
        let table = Arc::clone(&analytics);
        let registry = Arc::new(
            StoreRegistry::builder()
                .store(Arc::new(IdentityStore::new("identity", 0)))
                .store(Arc::new(MetadataStore::with_table("metadata", 1, Arc::clone(&metadata))))
                .analytics_factory(2, move |p| {
                    Arc::new(AnalyticsStore::with_table(p.clone(), 2, Arc::clone(&table)))
                        as Arc<dyn StoreAdapter>
                })
                .build()
                .unwrap(),
        );
        let escalations = Arc::new(Escalations::default());
        let collaborators = Collaborators {
            catalog: Arc::new(NoBackups),
            gate,
            alerts: Arc::new(TracingAlertSink),
            escalations: Arc::clone(&escalations),
            state: Arc::new(StateStore::new(Arc::clone(&registry))),
        };
        Fixture {
            metadata,
            analytics,
            executor: RecoveryExecutor::new(
                registry,
                EntityTypeSpec::builtins(),
                RecoverySettings::default(),
                collaborators,
                chrono::Duration::days(90),
            ),
            escalations,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_gate(Arc::new(AllowAll))
    }

    fn key() -> EntityKey {
        EntityKey::new(EntityType::principal(), "p1")
    }

    fn analytics_target() -> RecoveryTarget {
        RecoveryTarget::entity(
            StoreId::new("analytics:p1"),
            key(),
            Some(PrincipalId::new("p1")),
        )
    }

    fn planned(strategy: Strategy, source: Option<&str>) -> PlannedStrategy {
        PlannedStrategy {
            strategy,
            data_loss_estimate: DataLoss::None,
            source: source.map(StoreId::new),
            backup: None,
        }
    }

    #[tokio::test]
    async fn rebuild_copies_with_provenance() {
        let fx = fixture();
        fx.metadata
            .write(&key(), EntityRecord::new(serde_json::json!({"n": 1})).with_sub_entities(3));

        let attempt = RecoveryAttempt::pending(
            None,
            analytics_target(),
            &planned(Strategy::RebuildFromAuthoritative, Some("metadata")),
        );
        let done = fx.executor.execute(attempt).await;
        assert_eq!(done.status, AttemptStatus::Succeeded);

        let copied = fx.analytics.read(&StoreId::new("analytics:p1"), &key()).unwrap().unwrap();
        assert_eq!(copied.sub_entity_count, 3);
        let provenance = copied.provenance.unwrap();
        assert_eq!(provenance.added_by, "recovery");
        assert_eq!(provenance.recovered_from, Some(StoreId::new("metadata")));
        assert_eq!(fx.executor.audit().len(), 1);
    }

    #[tokio::test]
    async fn executing_twice_is_idempotent() {
        let fx = fixture();
        fx.metadata
            .write(&key(), EntityRecord::new(serde_json::json!({"n": 1})).with_sub_entities(2));
        let attempt = RecoveryAttempt::pending(
            None,
            analytics_target(),
            &planned(Strategy::RebuildFromAuthoritative, Some("metadata")),
        );

        fx.executor.execute(attempt.clone()).await;
        let once = fx.analytics.snapshot();
        fx.executor.execute(attempt).await;
        let twice = fx.analytics.snapshot();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn failed_strategy_falls_back_to_next() {
        let fx = fixture();
        let plan = RecoveryPlan {
            inconsistency_ref: Some(InconsistencyId::new()),
            target: analytics_target(),
            strategies: vec![
                planned(Strategy::RebuildFromAuthoritative, Some("metadata")),
                planned(Strategy::RecreateClean, None),
            ],
        };
        let report = fx.executor.run(&plan).await;
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[0].status, AttemptStatus::Failed);
        assert_ne!(report.attempts[0].id, report.attempts[1].id);
        assert!(fx.analytics.read(&StoreId::new("analytics:p1"), &key()).unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_success_is_retried() {
        let fx = fixture();
        fx.metadata.write(&key(), EntityRecord::placeholder());
        fx.metadata.corrupt(&EntityKey::new(EntityType::principal(), "p2"), "torn page");

        let plan = RecoveryPlan {
            inconsistency_ref: None,
            target: RecoveryTarget::whole_store(StoreId::new("metadata"), None),
            strategies: vec![planned(Strategy::RepairInPlace, None)],
        };
        let report = fx.executor.run(&plan).await;

        // The first pass drops the torn row, so the retry reads a clean table.
        assert_eq!(report.outcome, RecoveryOutcome::Recovered);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[0].status, AttemptStatus::PartialSuccess);
        assert_eq!(report.attempts[1].status, AttemptStatus::Succeeded);
        assert_eq!(report.attempts[1].retry_of, Some(report.attempts[0].id));
        assert_eq!(report.attempts[1].attempt, 2);
        assert!(fx.metadata.read(&StoreId::new("metadata"), &key()).unwrap().is_some());
    }

    #[tokio::test]
    async fn exhaustion_escalates() {
        let fx = fixture();
        let plan = RecoveryPlan {
            inconsistency_ref: Some(InconsistencyId::new()),
            target: RecoveryTarget::whole_store(StoreId::new("identity"), None),
            strategies: vec![planned(Strategy::RecreateClean, None)],
        };
        let report = fx.executor.run(&plan).await;
        assert_eq!(report.outcome, RecoveryOutcome::Exhausted);
        let open = fx.escalations.open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, EscalationKind::RecoveryExhausted);
        assert_eq!(open[0].inconsistency_ref, plan.inconsistency_ref);
    }

    #[tokio::test]
    async fn invalid_credential_blocks_identity_write() {
        let fx = fixture_with_gate(Arc::new(DenyAll));
        let attempt = RecoveryAttempt::pending(
            None,
            RecoveryTarget::entity(StoreId::new("identity"), key(), Some(PrincipalId::new("p1"))),
            &planned(Strategy::RebuildFromAuthoritative, Some("metadata")),
        );
        let done = fx.executor.execute(attempt).await;
        assert_eq!(done.status, AttemptStatus::Failed);
        assert!(done.error.unwrap().contains("not authenticated"));
    }

    #[tokio::test]
    async fn identity_entity_is_never_recreated_empty() {
        let fx = fixture();
        let attempt = RecoveryAttempt::pending(
            None,
            RecoveryTarget::entity(StoreId::new("identity"), key(), Some(PrincipalId::new("p1"))),
            &planned(Strategy::RecreateClean, None),
        );
        let done = fx.executor.execute(attempt).await;
        assert_eq!(done.status, AttemptStatus::Failed);
        assert!(done.error.unwrap().contains("cannot be recreated empty"));

        let identity = fx.executor.registry.get(&StoreId::new("identity")).unwrap();
        assert!(identity.read(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scoped_repair_touches_only_its_entity() {
        let fx = fixture();
        let metadata = StoreId::new("metadata");
        let p2 = EntityKey::new(EntityType::principal(), "p2");
        let p3 = EntityKey::new(EntityType::principal(), "p3");
        fx.metadata.corrupt(&key(), "torn page");
        fx.metadata.write(&p2, EntityRecord::new(serde_json::json!({"n": 2})));
        fx.metadata.corrupt(&p3, "torn page");

        let attempt = RecoveryAttempt::pending(
            None,
            RecoveryTarget::entity(metadata.clone(), key(), None),
            &planned(Strategy::RepairInPlace, None),
        );
        let done = fx.executor.execute(attempt).await;
        assert_eq!(done.status, AttemptStatus::Failed);
        assert!(done.error.unwrap().contains("removed"));

        assert!(fx.metadata.read(&metadata, &key()).unwrap().is_none());
        assert!(fx.metadata.read(&metadata, &p2).unwrap().is_some());
        assert!(fx.metadata.read(&metadata, &p3).is_err());

        let readable = RecoveryAttempt::pending(
            None,
            RecoveryTarget::entity(metadata.clone(), p2.clone(), None),
            &planned(Strategy::RepairInPlace, None),
        );
        assert_eq!(fx.executor.execute(readable).await.status, AttemptStatus::Succeeded);
        assert!(fx.metadata.read(&metadata, &p3).is_err());
    }

    #[tokio::test]
    async fn acknowledge_clears_waiting_attempt() {
        let fx = fixture();
        let mut attempt = RecoveryAttempt::pending(
            None,
            analytics_target(),
            &planned(Strategy::RepairInPlace, None),
        );
        attempt.status = AttemptStatus::PartialSuccess;
        fx.executor.awaiting_ack.insert(attempt.id, attempt.clone());

        assert_eq!(fx.executor.awaiting_acknowledgement().len(), 1);
        assert!(fx.executor.acknowledge(attempt.id).is_some());
        assert!(fx.executor.awaiting_acknowledgement().is_empty());
    }
}
