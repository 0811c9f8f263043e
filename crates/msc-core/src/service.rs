//! Consistency service
//!
//! Owns every component and the background scan loop:
//! - Health Monitor and Inconsistency Detector run once per cycle on one snapshot
//! - findings are persisted to the reserved namespace with the breaker states
//! - non-stale findings are recovered automatically when enabled
//! - operators force recovery or repair a whole store out of cycle

use crate::audit::{DetectionPass, Escalations, InconsistencyHistory, ReconciliationQueue};
use crate::config::ConsistencyConfig;
use crate::detector::{Inconsistency, InconsistencyDetector, KnownEntities, StoreListing};
use crate::error::ConsistencyError;
use crate::executor::{
    AlertSink, AllowAll, Collaborators, CredentialGate, RecoveryExecutor, RecoveryOutcome,
    RecoveryReport, TracingAlertSink,
};
use crate::health::{HealthMonitor, HealthSnapshot, HealthStatus};
use crate::ids::InconsistencyId;
use crate::persistence::StateStore;
use crate::status::StatusView;
use crate::strategy::{BackupCatalog, NoBackups, RecoveryPlan, StrategyEngine};
use crate::transaction::TransactionCoordinator;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use msc_breaker::{CircuitBreakerState, StoreRegistry};
use msc_store::{PrincipalId, StoreId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const ANALYTICS_PREFIX: &str = "analytics:";

/// Summary of one scan cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub overall: HealthStatus,
    pub detected: usize,
    /// Findings skipped by recovery because stores were excluded
    pub stale: usize,
    /// Findings left to operators because their recovery already escalated
    pub escalated: usize,
    pub recovered: Vec<InconsistencyId>,
    pub reports: Vec<RecoveryReport>,
}

/// Builder for [`ConsistencyService`]
#[derive(Debug)]
pub struct ConsistencyServiceBuilder {
    config: ConsistencyConfig,
    registry: Arc<StoreRegistry>,
    catalog: Arc<dyn BackupCatalog>,
    gate: Arc<dyn CredentialGate>,
    alerts: Arc<dyn AlertSink>,
    known: Option<Arc<dyn KnownEntities>>,
}

impl ConsistencyServiceBuilder {
    /// Backup catalog consulted by the strategy engine
    #[inline]
    #[must_use]
    pub fn backup_catalog(mut self, catalog: Arc<dyn BackupCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Credential signal consulted before identity writes
    #[inline]
    #[must_use]
    pub fn credential_gate(mut self, gate: Arc<dyn CredentialGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Operator alert delivery
    #[inline]
    #[must_use]
    pub fn alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Source of entity ids to scan; defaults to listing every store
    #[inline]
    #[must_use]
    pub fn known_entities(mut self, known: Arc<dyn KnownEntities>) -> Self {
        self.known = Some(known);
        self
    }

    /// Validate the configuration and wire the components
    pub fn build(self) -> Result<ConsistencyService, ConsistencyError> {
        let Self {
            config,
            registry,
            catalog,
            gate,
            alerts,
            known,
        } = self;
        config.validate()?;

        let specs = config.entity_specs();
        let retention = config.audit.retention();
        let workers = config.scan.worker_pool;
        let state = Arc::new(StateStore::new(Arc::clone(&registry)));
        let escalations = Arc::new(Escalations::default());
        let collaborators = Collaborators {
            catalog: Arc::clone(&catalog),
            gate,
            alerts,
            escalations: Arc::clone(&escalations),
            state: Arc::clone(&state),
        };
        let known = known.unwrap_or_else(|| Arc::new(StoreListing::new(Arc::clone(&registry))));

        Ok(ConsistencyService {
            monitor: Arc::new(HealthMonitor::new(Arc::clone(&registry), config.health, workers)),
            detector: InconsistencyDetector::new(Arc::clone(&registry), specs.clone(), known, workers),
            engine: StrategyEngine::new(Arc::clone(&registry), catalog, specs.clone(), config.recovery),
            executor: RecoveryExecutor::new(
                Arc::clone(&registry),
                specs,
                config.recovery,
                collaborators.clone(),
                retention,
            ),
            coordinator: TransactionCoordinator::new(
                Arc::clone(&registry),
                collaborators,
                Arc::new(ReconciliationQueue::default()),
                retention,
            ),
            history: InconsistencyHistory::new(config.audit.inconsistency_history),
            resolved: RwLock::new(BTreeSet::new()),
            last_cycle: RwLock::new(None),
            cycle: Mutex::new(()),
            registry,
            state,
            escalations,
            config,
        })
    }
}

/// The coordinator
#[derive(Debug)]
pub struct ConsistencyService {
    config: ConsistencyConfig,
    registry: Arc<StoreRegistry>,
    monitor: Arc<HealthMonitor>,
    detector: InconsistencyDetector,
    engine: StrategyEngine,
    executor: RecoveryExecutor,
    coordinator: TransactionCoordinator,
    state: Arc<StateStore>,
    escalations: Arc<Escalations>,
    history: InconsistencyHistory,
    /// Findings of the latest pass recovered since it completed
    resolved: RwLock<BTreeSet<InconsistencyId>>,
    last_cycle: RwLock<Option<DateTime<Utc>>>,
    /// Serializes cycles so only one pass runs at a time
    cycle: Mutex<()>,
}

impl ConsistencyService {
    /// Start building a service over `registry`
    #[must_use]
    pub fn builder(config: ConsistencyConfig, registry: Arc<StoreRegistry>) -> ConsistencyServiceBuilder {
        ConsistencyServiceBuilder {
            config,
            registry,
            catalog: Arc::new(NoBackups),
            gate: Arc::new(AllowAll),
            alerts: Arc::new(TracingAlertSink),
            known: None,
        }
    }

    /// Configuration in force
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Store registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Health monitor
    #[inline]
    #[must_use]
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Transaction coordinator for application writes
    #[inline]
    #[must_use]
    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Recovery executor
    #[inline]
    #[must_use]
    pub fn executor(&self) -> &RecoveryExecutor {
        &self.executor
    }

    /// Open escalations
    #[inline]
    #[must_use]
    pub fn escalations(&self) -> &Arc<Escalations> {
        &self.escalations
    }

    /// Detection history
    #[inline]
    #[must_use]
    pub fn history(&self) -> &InconsistencyHistory {
        &self.history
    }

    /// Reload breaker states, detection history and the attempt and
    /// transaction audit logs from the metadata store
    pub async fn restore(&self) -> Result<(), ConsistencyError> {
        let saved = self.state.load_breakers().await?;
        let mut restored = 0;
        for state in &saved {
            let store = match state.store_id.as_str().strip_prefix(ANALYTICS_PREFIX) {
                Some(principal) if self.registry.has_analytics() => {
                    Some(self.registry.analytics(&PrincipalId::new(principal))?)
                }
                _ => self.registry.get(&state.store_id),
            };
            match store {
                Some(store) => {
                    store.breaker().restore(state);
                    restored += 1;
                }
                None => debug!(store = %state.store_id, "ignoring breaker state of unknown store"),
            }
        }

        let passes = self.state.load_history().await?;
        let pass_count = passes.len();
        self.history.replace(passes);

        let attempts = self.executor.restore_audit(self.state.load_attempts().await?);
        let transactions = self
            .coordinator
            .restore_audit(self.state.load_transactions().await?);
        info!(
            breakers = restored,
            passes = pass_count,
            attempts,
            transactions,
            "coordinator state restored"
        );
        Ok(())
    }

    /// Run one health + detection + recovery cycle
    ///
    /// # Workflow
    /// 1. Probe every store and publish a snapshot
    /// 2. Scan every entity type against that snapshot
    /// 3. Persist the pass and the breaker states
    /// 4. Recover non-stale findings when `recovery.auto_recover` is set,
    ///    skipping those whose recovery chain already exhausted
    pub async fn run_cycle(&self) -> Result<CycleReport, ConsistencyError> {
        let _cycle = self.cycle.lock().await;
        let started_at = Utc::now();

        let snapshot = self.monitor.scan().await?;
        let found = self.carry_ids(self.detector.detect_all(&snapshot).await?);
        let stale = found.iter().filter(|inconsistency| inconsistency.stale).count();
        if !found.is_empty() {
            info!(
                error = %ConsistencyError::InconsistencyDetected { count: found.len() },
                stale,
                "detection pass found inconsistencies"
            );
        }

        self.history.push(DetectionPass {
            completed_at: Utc::now(),
            inconsistencies: found.clone(),
        });
        self.resolved.write().clear();
        self.settle_reconciliations(&found);
        self.persist().await;

        let mut reports = Vec::new();
        let mut recovered = Vec::new();
        let mut escalated = 0;
        if self.config.recovery.auto_recover {
            let candidates: Vec<Inconsistency> = found
                .iter()
                .filter(|inconsistency| !inconsistency.stale)
                .filter(|inconsistency| {
                    let waiting = self.escalations.exhausted(inconsistency.id);
                    if waiting {
                        escalated += 1;
                        debug!(inconsistency = %inconsistency.id, "recovery exhausted earlier, waiting for operator");
                    }
                    !waiting
                })
                .cloned()
                .collect();
            let outcomes: Vec<_> = stream::iter(candidates)
                .map(|inconsistency| {
                    let snapshot = Arc::clone(&snapshot);
                    async move { (inconsistency.id, self.recover_one(&inconsistency, &snapshot).await) }
                })
                .buffer_unordered(self.config.scan.worker_pool)
                .collect()
                .await;
            for (id, outcome) in outcomes {
                match outcome {
                    Ok(batch) => {
                        if all_recovered(&batch) {
                            recovered.push(id);
                        }
                        reports.extend(batch);
                    }
                    Err(err) => warn!(inconsistency = %id, %err, "recovery planning failed"),
                }
            }
            recovered.sort();
        }

        self.prune(started_at).await;
        let finished_at = Utc::now();
        *self.last_cycle.write() = Some(finished_at);
        Ok(CycleReport {
            started_at,
            finished_at,
            overall: snapshot.overall(),
            detected: found.len(),
            stale,
            escalated,
            recovered,
            reports,
        })
    }

    /// Inconsistency of the latest pass that can be recovered now
    ///
    /// Unknown ids give `UnknownInconsistency`; stale findings give
    /// `StaleInconsistency` until a pass sees every relevant store.
    pub fn recoverable(&self, id: InconsistencyId) -> Result<Inconsistency, ConsistencyError> {
        let inconsistency = self
            .open_inconsistencies()
            .into_iter()
            .find(|inconsistency| inconsistency.id == id)
            .ok_or_else(|| ConsistencyError::UnknownInconsistency(id.to_string()))?;
        if inconsistency.stale {
            return Err(ConsistencyError::StaleInconsistency(id.to_string()));
        }
        Ok(inconsistency)
    }

    /// Force recovery of one inconsistency out of cycle
    pub async fn recover(&self, id: InconsistencyId) -> Result<Vec<RecoveryReport>, ConsistencyError> {
        let inconsistency = self.recoverable(id)?;
        let snapshot = self.monitor.latest();
        self.recover_one(&inconsistency, &snapshot).await
    }

    /// Plan and run a whole-store repair, e.g. after structural damage
    pub async fn repair_store(&self, store_id: &StoreId) -> Result<RecoveryReport, ConsistencyError> {
        let snapshot = self.monitor.latest();
        let plan = self.engine.plan_store(store_id, &snapshot).await?;
        Ok(self.executor.run(&plan).await)
    }

    /// Current status document
    #[must_use]
    pub fn status(&self) -> StatusView {
        let health = self.monitor.latest();
        StatusView {
            overall: health.overall(),
            health: HealthSnapshot::clone(&health),
            breakers: self.breaker_states(),
            open_inconsistencies: self.open_inconsistencies(),
            escalations: self.escalations.open(),
            awaiting_acknowledgement: self.executor.awaiting_acknowledgement(),
            unacknowledged_transactions: self.coordinator.unacknowledged(),
            pending_reconciliations: self.coordinator.reconciliations().pending(),
            last_cycle_at: *self.last_cycle.read(),
        }
    }

    /// Latest pass findings not recovered since
    #[must_use]
    pub fn open_inconsistencies(&self) -> Vec<Inconsistency> {
        let resolved = self.resolved.read();
        self.history
            .latest()
            .map(|pass| {
                pass.inconsistencies
                    .into_iter()
                    .filter(|inconsistency| !resolved.contains(&inconsistency.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run cycles every `scan.interval_secs` until `shutdown` flips to true
    ///
    /// Also starts the monitor's breaker transition listener.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let listener = Arc::clone(&self.monitor).spawn_transition_listener(shutdown.clone());
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.scan.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => match self.run_cycle().await {
                        Ok(report) => debug!(
                            detected = report.detected,
                            recovered = report.recovered.len(),
                            overall = ?report.overall,
                            "scan cycle complete"
                        ),
                        Err(err) => warn!(%err, "scan cycle failed"),
                    },
                }
            }
            if let Err(err) = listener.await {
                warn!(%err, "transition listener ended abnormally");
            }
            info!("scan loop stopped");
        })
    }

    async fn recover_one(
        &self,
        inconsistency: &Inconsistency,
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<RecoveryReport>, ConsistencyError> {
        let plans: Vec<RecoveryPlan> = self.engine.plan(inconsistency, snapshot).await?;
        let mut reports = Vec::with_capacity(plans.len());
        for plan in &plans {
            reports.push(self.executor.run(plan).await);
        }
        if all_recovered(&reports) {
            self.resolved.write().insert(inconsistency.id);
            self.coordinator.reconciliations().settle(&inconsistency.key());
        }
        Ok(reports)
    }

    /// Keep the id of a finding that was already reported by the previous pass
    fn carry_ids(&self, found: Vec<Inconsistency>) -> Vec<Inconsistency> {
        let Some(previous) = self.history.latest() else {
            return found;
        };
        found
            .into_iter()
            .map(|mut inconsistency| {
                if let Some(earlier) = previous
                    .inconsistencies
                    .iter()
                    .find(|earlier| earlier.same_finding(&inconsistency))
                {
                    inconsistency.id = earlier.id;
                    inconsistency.detected_at = earlier.detected_at;
                }
                inconsistency
            })
            .collect()
    }

    /// Clear hand-offs whose entity the pass found consistent
    fn settle_reconciliations(&self, found: &[Inconsistency]) {
        let queue = self.coordinator.reconciliations();
        for pending in queue.pending() {
            let Some(entity) = &pending.entity else {
                continue;
            };
            let in_doubt = found
                .iter()
                .any(|inconsistency| &inconsistency.key() == entity);
            if !in_doubt && queue.settle(entity) > 0 {
                debug!(%entity, transaction = %pending.transaction_id, "reconciliation settled");
            }
        }
    }

    fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.registry
            .all()
            .iter()
            .map(|store| store.breaker().snapshot())
            .collect()
    }

    async fn persist(&self) {
        if let Err(err) = self.state.save_history(&self.history.passes()).await {
            warn!(%err, "detection history not persisted");
        }
        if let Err(err) = self.state.save_breakers(&self.breaker_states()).await {
            warn!(%err, "breaker states not persisted");
        }
    }

    async fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - self.config.audit.retention();
        self.executor.audit().prune(now);
        self.coordinator.audit().prune(now);
        if let Err(err) = self.state.prune_audit(cutoff).await {
            warn!(%err, "audit pruning failed");
        }
    }
}

fn all_recovered(reports: &[RecoveryReport]) -> bool {
    reports
        .iter()
        .all(|report| report.outcome == RecoveryOutcome::Recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoverySettings;
    use msc_breaker::BreakerState;
    use msc_store::{
        AnalyticsStore, EntityKey, EntityRecord, EntityType, IdentityStore, MemoryTable,
        MetadataStore, StoreAdapter,
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        identity: Arc<MemoryTable>,
        metadata: Arc<MemoryTable>,
        analytics: Arc<MemoryTable>,
        registry: Arc<StoreRegistry>,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryTable::new());
        let metadata = Arc::new(MemoryTable::new());
        let analytics = Arc::new(MemoryTable::uninitialized());
        let table = Arc::clone(&analytics);
        let registry = Arc::new(
            StoreRegistry::builder()
                .store(Arc::new(IdentityStore::with_table("identity", 0, Arc::clone(&identity))))
                .store(Arc::new(MetadataStore::with_table("metadata", 1, Arc::clone(&metadata))))
                .analytics_factory(2, move |p| {
                    Arc::new(AnalyticsStore::with_table(p.clone(), 2, Arc::clone(&table)))
                        as Arc<dyn StoreAdapter>
                })
                .build()
                .unwrap(),
        );
        Fixture {
            identity,
            metadata,
            analytics,
            registry,
        }
    }

    fn service(fx: &Fixture, auto_recover: bool) -> ConsistencyService {
        let config = ConsistencyConfig::default()
            .with_recovery(RecoverySettings::default().with_auto_recover(auto_recover));
        ConsistencyService::builder(config, Arc::clone(&fx.registry))
            .build()
            .unwrap()
    }

    fn seed_principal(fx: &Fixture) -> EntityKey {
        let key = EntityKey::new(EntityType::principal(), "p1");
        fx.identity.write(&key, EntityRecord::placeholder());
        fx.metadata.write(&key, EntityRecord::new(serde_json::json!({"name": "p1"})));
        key
    }

    #[tokio::test]
    async fn cycle_detects_and_recovers() {
        let fx = fixture();
        let key = seed_principal(&fx);
        let service = service(&fx, true);

        let report = service.run_cycle().await.unwrap();
        assert_eq!(report.detected, 1);
        assert_eq!(report.recovered.len(), 1);
        assert!(fx.analytics.read(&StoreId::new("analytics:p1"), &key).unwrap().is_some());
        assert!(service.open_inconsistencies().is_empty());

        let again = service.run_cycle().await.unwrap();
        assert_eq!(again.detected, 0);
    }

    #[tokio::test]
    async fn ids_are_stable_across_passes() {
        let fx = fixture();
        seed_principal(&fx);
        let service = service(&fx, false);

        service.run_cycle().await.unwrap();
        let first = service.open_inconsistencies();
        service.run_cycle().await.unwrap();
        let second = service.open_inconsistencies();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn forced_recovery_checks_id() {
        let fx = fixture();
        seed_principal(&fx);
        let service = service(&fx, false);

        let err = service.recover(InconsistencyId::new()).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::UnknownInconsistency(_)));

        service.run_cycle().await.unwrap();
        let id = service.open_inconsistencies()[0].id;
        let reports = service.recover(id).await.unwrap();
        assert!(all_recovered(&reports));
        assert!(service.status().open_inconsistencies.is_empty());
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let fx = fixture();
        seed_principal(&fx);
        let service = service(&fx, false);
        service.run_cycle().await.unwrap();
        let identity = fx.registry.get(&StoreId::new("identity")).unwrap();
        identity.breaker().force_open(tokio::time::Instant::now());
        service.run_cycle().await.unwrap();

        let restarted = fixture_sharing(&fx);
        let service = ConsistencyService::builder(ConsistencyConfig::default(), Arc::clone(&restarted))
            .build()
            .unwrap();
        service.restore().await.unwrap();

        let identity = restarted.get(&StoreId::new("identity")).unwrap();
        assert_eq!(identity.breaker().state(), BreakerState::Open);
        assert_eq!(service.history().passes().len(), 2);
    }

    #[tokio::test]
    async fn audit_logs_survive_restart() {
        let fx = fixture();
        seed_principal(&fx);
        let service = service(&fx, true);
        service.run_cycle().await.unwrap();
        let committed = service
            .coordinator()
            .run(vec![crate::transaction::WriteStep::put(
                "metadata",
                EntityKey::new(EntityType::principal(), "p2"),
                EntityRecord::new(serde_json::json!({"name": "p2"})),
            )])
            .await
            .unwrap();
        let attempts = service.executor().audit().entries();
        assert_eq!(attempts.len(), 1);

        let restarted = fixture_sharing(&fx);
        let service = ConsistencyService::builder(ConsistencyConfig::default(), Arc::clone(&restarted))
            .build()
            .unwrap();
        assert!(service.executor().audit().is_empty());
        service.restore().await.unwrap();

        let restored = service.executor().audit().entries();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, attempts[0].id);
        assert_eq!(restored[0].status, attempts[0].status);
        let transactions = service.coordinator().audit().entries();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].transaction_id, committed.transaction_id);
        assert_eq!(transactions[0].phase, crate::transaction::TransactionPhase::Committed);
    }

    fn fixture_sharing(fx: &Fixture) -> Arc<StoreRegistry> {
        let table = Arc::clone(&fx.analytics);
        Arc::new(
            StoreRegistry::builder()
                .store(Arc::new(IdentityStore::with_table("identity", 0, Arc::clone(&fx.identity))))
                .store(Arc::new(MetadataStore::with_table("metadata", 1, Arc::clone(&fx.metadata))))
                .analytics_factory(2, move |p| {
                    Arc::new(AnalyticsStore::with_table(p.clone(), 2, Arc::clone(&table)))
                        as Arc<dyn StoreAdapter>
                })
                .build()
                .unwrap(),
        )
    }
}
