//! Testing utilities for MSC workspace
//!
//! Shared fault injection, collaborators and topology fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use msc_breaker::StoreRegistry;
use msc_core::{AlertSink, BackupCatalog, BackupInfo, CredentialGate, Escalation};
use msc_store::{
    AnalyticsStore, EntityId, EntityKey, EntityRecord, EntityType, Extraction, IdentityStore,
    MemoryTable, MetadataStore, PrincipalId, ProbeReport, StoreAdapter, StoreCapabilities,
    StoreDescriptor, StoreError, StoreId,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Adapter wrapper with switchable faults
///
/// Every call first sleeps for the configured latency, then fails if a fault
/// applies. Reads and listings are only affected by `fail_next` and
/// `fail_always`; `fail_mutations` and `fail_mutations_after` leave them
/// working so detection still runs.
#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<dyn StoreAdapter>,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    fail_mutations: AtomicBool,
    /// Mutations allowed before every later one fails
    mutation_budget: Mutex<Option<usize>>,
    structural: AtomicBool,
    latency: Mutex<Option<Duration>>,
    capabilities: Mutex<Option<StoreCapabilities>>,
    calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn StoreAdapter>) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            fail_mutations: AtomicBool::new(false),
            mutation_budget: Mutex::new(None),
            structural: AtomicBool::new(false),
            latency: Mutex::new(None),
            capabilities: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` calls of any kind
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, enabled: bool) {
        self.fail_always.store(enabled, Ordering::SeqCst);
    }

    /// Fail writes, deletes, extraction, initialization and recreation
    pub fn fail_mutations(&self, enabled: bool) {
        self.fail_mutations.store(enabled, Ordering::SeqCst);
    }

    /// Let `n` more mutations through, then fail the rest
    pub fn fail_mutations_after(&self, n: usize) {
        *self.mutation_budget.lock() = Some(n);
    }

    /// Report structural damage from probes
    pub fn structural_failure(&self, enabled: bool) {
        self.structural.store(enabled, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn set_capabilities(&self, capabilities: StoreCapabilities) {
        *self.capabilities.lock() = Some(capabilities);
    }

    /// Calls that reached this adapter
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn heal(&self) {
        self.fail_next(0);
        self.fail_always(false);
        self.fail_mutations(false);
        *self.mutation_budget.lock() = None;
        self.structural_failure(false);
        self.set_latency(None);
    }

    async fn enter(&self, operation: &str, mutation: bool) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scheduled = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let over_budget = mutation && {
            let mut budget = self.mutation_budget.lock();
            match budget.as_mut() {
                Some(0) => true,
                Some(left) => {
                    *left -= 1;
                    false
                }
                None => false,
            }
        };
        let failing = scheduled
            || over_budget
            || self.fail_always.load(Ordering::SeqCst)
            || (mutation && self.fail_mutations.load(Ordering::SeqCst));
        if failing {
            Err(StoreError::io(
                &self.inner.descriptor().store_id,
                format!("injected {operation} fault"),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreAdapter for FaultyStore {
    fn descriptor(&self) -> &StoreDescriptor {
        self.inner.descriptor()
    }

    fn capabilities(&self) -> StoreCapabilities {
        let overridden = *self.capabilities.lock();
        overridden.unwrap_or_else(|| self.inner.capabilities())
    }

    async fn probe(&self) -> Result<ProbeReport, StoreError> {
        self.enter("probe", false).await?;
        let mut report = self.inner.probe().await?;
        if self.structural.load(Ordering::SeqCst) {
            report.structural_failure = true;
            report.warning.get_or_insert_with(|| "injected structural damage".to_string());
        }
        Ok(report)
    }

    async fn read_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StoreError> {
        self.enter("read", false).await?;
        self.inner.read_entity(key).await
    }

    async fn write_entity(&self, key: &EntityKey, record: EntityRecord) -> Result<(), StoreError> {
        self.enter("write", true).await?;
        self.inner.write_entity(key, record).await
    }

    async fn delete_entity(&self, key: &EntityKey) -> Result<bool, StoreError> {
        self.enter("delete", true).await?;
        self.inner.delete_entity(key).await
    }

    async fn list_entities(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError> {
        self.enter("list", false).await?;
        self.inner.list_entities(entity_type).await
    }

    async fn extract(&self) -> Result<Extraction, StoreError> {
        self.enter("extract", true).await?;
        self.inner.extract().await
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.enter("initialize", true).await?;
        self.inner.initialize().await
    }

    async fn recreate(&self) -> Result<(), StoreError> {
        self.enter("recreate", true).await?;
        self.inner.recreate().await
    }
}

/// In-memory backup catalog
#[derive(Debug, Default)]
pub struct MemoryBackupCatalog {
    backups: DashMap<StoreId, (BackupInfo, Vec<(EntityKey, EntityRecord)>)>,
}

impl MemoryBackupCatalog {
    /// Register the latest backup of `store_id`
    pub fn add(
        &self,
        store_id: impl Into<StoreId>,
        taken_at: DateTime<Utc>,
        records: Vec<(EntityKey, EntityRecord)>,
    ) -> BackupInfo {
        let store_id = store_id.into();
        let info = BackupInfo {
            backup_id: format!("{store_id}@{}", taken_at.timestamp()),
            store_id: store_id.clone(),
            taken_at,
        };
        self.backups.insert(store_id, (info.clone(), records));
        info
    }
}

#[async_trait]
impl BackupCatalog for MemoryBackupCatalog {
    async fn latest(&self, store_id: &StoreId) -> Result<Option<BackupInfo>, StoreError> {
        Ok(self.backups.get(store_id).map(|entry| entry.value().0.clone()))
    }

    async fn load(
        &self,
        backup: &BackupInfo,
        scope: Option<&EntityKey>,
    ) -> Result<Vec<(EntityKey, EntityRecord)>, StoreError> {
        let Some(entry) = self.backups.get(&backup.store_id) else {
            return Err(StoreError::io(&backup.store_id, "backup vanished"));
        };
        Ok(entry
            .value()
            .1
            .iter()
            .filter(|(key, _)| scope.map_or(true, |wanted| wanted == key))
            .cloned()
            .collect())
    }
}

/// Credential gate with a revocation list
#[derive(Debug, Default)]
pub struct StaticCredentials {
    revoked: Mutex<HashSet<PrincipalId>>,
}

impl StaticCredentials {
    pub fn revoke(&self, principal: impl Into<PrincipalId>) {
        self.revoked.lock().insert(principal.into());
    }
}

#[async_trait]
impl CredentialGate for StaticCredentials {
    async fn credential_valid(&self, principal: &PrincipalId) -> bool {
        !self.revoked.lock().contains(principal)
    }
}

/// Alert sink that keeps every escalation
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    received: Mutex<Vec<Escalation>>,
}

impl RecordingAlerts {
    pub fn received(&self) -> Vec<Escalation> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, escalation: &Escalation) {
        self.received.lock().push(escalation.clone());
    }
}

/// Identity (rank 0), metadata (rank 1) and per-principal analytics (rank 2)
/// stores, each behind a [`FaultyStore`]
#[derive(Debug)]
pub struct Topology {
    pub identity: Arc<MemoryTable>,
    pub identity_faults: Arc<FaultyStore>,
    pub metadata: Arc<MemoryTable>,
    pub metadata_faults: Arc<FaultyStore>,
    analytics: Arc<DashMap<PrincipalId, (Arc<MemoryTable>, Arc<FaultyStore>)>>,
    pub registry: Arc<StoreRegistry>,
}

impl Topology {
    pub fn new() -> Self {
        let identity = Arc::new(MemoryTable::new());
        let metadata = Arc::new(MemoryTable::new());
        let identity_faults = Arc::new(FaultyStore::new(Arc::new(IdentityStore::with_table(
            "identity",
            0,
            Arc::clone(&identity),
        ))));
        let metadata_faults = Arc::new(FaultyStore::new(Arc::new(MetadataStore::with_table(
            "metadata",
            1,
            Arc::clone(&metadata),
        ))));

        let analytics: Arc<DashMap<PrincipalId, (Arc<MemoryTable>, Arc<FaultyStore>)>> =
            Arc::new(DashMap::new());
        let slots = Arc::clone(&analytics);
        let registry = StoreRegistry::builder()
            .store(Arc::clone(&identity_faults) as Arc<dyn StoreAdapter>)
            .store(Arc::clone(&metadata_faults) as Arc<dyn StoreAdapter>)
            .analytics_factory(2, move |principal| {
                let entry = analytics_slot(&slots, principal);
                Arc::clone(&entry.1) as Arc<dyn StoreAdapter>
            })
            .build()
            .expect("fixture topology is valid");

        Self {
            identity,
            identity_faults,
            metadata,
            metadata_faults,
            analytics,
            registry: Arc::new(registry),
        }
    }

    /// Backing table of `principal`'s analytics store
    pub fn analytics(&self, principal: &str) -> Arc<MemoryTable> {
        Arc::clone(&analytics_slot(&self.analytics, &PrincipalId::new(principal)).0)
    }

    /// Fault switches of `principal`'s analytics store
    pub fn analytics_faults(&self, principal: &str) -> Arc<FaultyStore> {
        Arc::clone(&analytics_slot(&self.analytics, &PrincipalId::new(principal)).1)
    }

    /// Put principal `id` in identity and metadata only
    pub fn seed_principal(&self, id: &str) -> EntityKey {
        self.seed_principal_with_executions(id, 0)
    }

    /// Put principal `id` with `executions` sub-entities in identity and metadata only
    pub fn seed_principal_with_executions(&self, id: &str, executions: u64) -> EntityKey {
        let key = principal_key(id);
        let record = principal_record(id, executions);
        self.identity.write(&key, record.clone());
        self.metadata.write(&key, record);
        key
    }

    /// Put principal `id` in every store
    pub fn seed_consistent(&self, id: &str) -> EntityKey {
        let key = self.seed_principal(id);
        self.analytics(id).write(&key, principal_record(id, 0));
        key
    }

    /// Whether `principal`'s analytics store holds `key`
    pub fn analytics_has(&self, principal: &str, key: &EntityKey) -> bool {
        self.analytics(principal)
            .read(&StoreId::analytics_for(&PrincipalId::new(principal)), key)
            .ok()
            .flatten()
            .is_some()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

fn analytics_slot(
    slots: &DashMap<PrincipalId, (Arc<MemoryTable>, Arc<FaultyStore>)>,
    principal: &PrincipalId,
) -> (Arc<MemoryTable>, Arc<FaultyStore>) {
    slots
        .entry(principal.clone())
        .or_insert_with(|| {
            let table = Arc::new(MemoryTable::uninitialized());
            let store = AnalyticsStore::with_table(principal.clone(), 2, Arc::clone(&table));
            (table, Arc::new(FaultyStore::new(Arc::new(store))))
        })
        .value()
        .clone()
}

pub fn principal_record(id: &str, executions: u64) -> EntityRecord {
    EntityRecord::new(serde_json::json!({ "name": id })).with_sub_entities(executions)
}

pub fn principal_key(id: &str) -> EntityKey {
    EntityKey::new(EntityType::principal(), id)
}

pub fn execution_key(id: &str) -> EntityKey {
    EntityKey::new(EntityType::execution(), id)
}
