//! Recovery strategy engine
//!
//! Maps an inconsistency (or a whole-store failure) to an ordered list of
//! candidate strategies. The first entry is the primary choice; the rest are
//! fallbacks, and `RecreateClean` always closes the list.

use crate::config::{EntityTypeSpec, RecoverySettings};
use crate::detector::Inconsistency;
use crate::error::ConsistencyError;
use crate::health::HealthSnapshot;
use crate::ids::InconsistencyId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use msc_breaker::{GuardedStore, StoreRegistry};
use msc_store::{EntityKey, EntityRecord, EntityType, PrincipalId, StoreError, StoreId, StoreRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Recovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    RebuildFromAuthoritative,
    RestoreFromBackup,
    RepairInPlace,
    RecreateClean,
}

impl Strategy {
    /// Stable name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RebuildFromAuthoritative => "RebuildFromAuthoritative",
            Self::RestoreFromBackup => "RestoreFromBackup",
            Self::RepairInPlace => "RepairInPlace",
            Self::RecreateClean => "RecreateClean",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected data loss of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLoss {
    None,
    Partial,
    Total,
}

/// What a recovery repairs: one entity in one store, or the whole store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoveryTarget {
    pub store_id: StoreId,
    /// Owning principal for analytics stores
    pub principal: Option<PrincipalId>,
    /// `None` for whole-store repairs
    pub entity: Option<EntityKey>,
}

impl RecoveryTarget {
    /// One entity in one store
    #[must_use]
    pub fn entity(store_id: StoreId, key: EntityKey, principal: Option<PrincipalId>) -> Self {
        Self {
            store_id,
            principal,
            entity: Some(key),
        }
    }

    /// Every entity scoped to a store
    #[must_use]
    pub fn whole_store(store_id: StoreId, principal: Option<PrincipalId>) -> Self {
        Self {
            store_id,
            principal,
            entity: None,
        }
    }

    /// Whether this is a whole-store repair
    #[inline]
    #[must_use]
    pub fn is_whole_store(&self) -> bool {
        self.entity.is_none()
    }
}

impl fmt::Display for RecoveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(key) => write!(f, "{}@{}", key, self.store_id),
            None => write!(f, "*@{}", self.store_id),
        }
    }
}

/// A backup known to the catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub store_id: StoreId,
    pub taken_at: DateTime<Utc>,
}

impl BackupInfo {
    /// Age at `now`
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.taken_at
    }
}

/// Store-specific backup collaborator
///
/// The coordinator never touches backup media itself; it asks the catalog
/// for the latest backup and for the records it holds.
#[async_trait]
pub trait BackupCatalog: Send + Sync + fmt::Debug {
    /// Most recent backup of `store_id`
    async fn latest(&self, store_id: &StoreId) -> Result<Option<BackupInfo>, StoreError>;

    /// Records held by `backup`, restricted to `scope` when given
    async fn load(
        &self,
        backup: &BackupInfo,
        scope: Option<&EntityKey>,
    ) -> Result<Vec<(EntityKey, EntityRecord)>, StoreError>;
}

/// Catalog with no backups
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackups;

#[async_trait]
impl BackupCatalog for NoBackups {
    async fn latest(&self, _store_id: &StoreId) -> Result<Option<BackupInfo>, StoreError> {
        Ok(None)
    }

    async fn load(
        &self,
        _backup: &BackupInfo,
        _scope: Option<&EntityKey>,
    ) -> Result<Vec<(EntityKey, EntityRecord)>, StoreError> {
        Ok(Vec::new())
    }
}

/// One candidate strategy with its inputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStrategy {
    pub strategy: Strategy,
    pub data_loss_estimate: DataLoss,
    /// Authoritative store to copy from
    pub source: Option<StoreId>,
    pub backup: Option<BackupInfo>,
}

impl PlannedStrategy {
    fn new(strategy: Strategy, data_loss_estimate: DataLoss) -> Self {
        Self {
            strategy,
            data_loss_estimate,
            source: None,
            backup: None,
        }
    }
}

/// Ordered strategies for one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// `None` for whole-store repairs
    pub inconsistency_ref: Option<InconsistencyId>,
    pub target: RecoveryTarget,
    pub strategies: Vec<PlannedStrategy>,
}

/// Strategy selection
#[derive(Debug)]
pub struct StrategyEngine {
    registry: Arc<StoreRegistry>,
    catalog: Arc<dyn BackupCatalog>,
    specs: BTreeMap<EntityType, EntityTypeSpec>,
    settings: RecoverySettings,
}

impl StrategyEngine {
    /// Create an engine
    #[must_use]
    pub fn new(
        registry: Arc<StoreRegistry>,
        catalog: Arc<dyn BackupCatalog>,
        specs: Vec<EntityTypeSpec>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            registry,
            catalog,
            specs: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
            settings,
        }
    }

    /// One plan per target store of `inconsistency`
    pub async fn plan(
        &self,
        inconsistency: &Inconsistency,
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<RecoveryPlan>, ConsistencyError> {
        let mut plans = Vec::new();
        for store_id in inconsistency.targets() {
            let strategies = self
                .select_strategy(inconsistency, &store_id, snapshot)
                .await?;
            let principal = self
                .target_store(&store_id, inconsistency.principal.as_ref())?
                .descriptor()
                .principal_scope
                .clone();
            plans.push(RecoveryPlan {
                inconsistency_ref: Some(inconsistency.id),
                target: RecoveryTarget::entity(store_id, inconsistency.key(), principal),
                strategies,
            });
        }
        Ok(plans)
    }

    /// Ordered candidate strategies for repairing `target` in `inconsistency`
    pub async fn select_strategy(
        &self,
        inconsistency: &Inconsistency,
        target: &StoreId,
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<PlannedStrategy>, ConsistencyError> {
        let spec = self.specs.get(&inconsistency.entity_type).ok_or_else(|| {
            ConsistencyError::config(format!(
                "no spec for entity type {}",
                inconsistency.entity_type
            ))
        })?;
        let store = self.target_store(target, inconsistency.principal.as_ref())?;

        let mut strategies = Vec::with_capacity(4);
        if let Some(source) = self.rebuild_source(spec, inconsistency, &store, snapshot)? {
            strategies.push(PlannedStrategy {
                source: Some(source),
                ..PlannedStrategy::new(Strategy::RebuildFromAuthoritative, DataLoss::None)
            });
        }
        self.push_common(&mut strategies, &store, snapshot).await;

        debug!(
            inconsistency = %inconsistency.id,
            target = %target,
            strategies = ?strategies.iter().map(|s| s.strategy).collect::<Vec<_>>(),
            "strategies selected"
        );
        Ok(strategies)
    }

    /// Plan for repairing every entity scoped to `store_id`
    pub async fn plan_store(
        &self,
        store_id: &StoreId,
        snapshot: &HealthSnapshot,
    ) -> Result<RecoveryPlan, ConsistencyError> {
        let store = self
            .registry
            .get(store_id)
            .ok_or_else(|| ConsistencyError::UnknownStore(store_id.clone()))?;

        let mut strategies = Vec::with_capacity(4);
        if store.capabilities().incremental_write {
            if let Some(source) = self.store_rebuild_source(&store, snapshot) {
                strategies.push(PlannedStrategy {
                    source: Some(source),
                    ..PlannedStrategy::new(Strategy::RebuildFromAuthoritative, DataLoss::None)
                });
            }
        }
        self.push_common(&mut strategies, &store, snapshot).await;

        Ok(RecoveryPlan {
            inconsistency_ref: None,
            target: RecoveryTarget::whole_store(
                store_id.clone(),
                store.descriptor().principal_scope.clone(),
            ),
            strategies,
        })
    }

    fn target_store(
        &self,
        store_id: &StoreId,
        principal: Option<&PrincipalId>,
    ) -> Result<Arc<GuardedStore>, ConsistencyError> {
        resolve_store(&self.registry, store_id, principal)
    }

    /// Most authoritative available store that holds the entity and may seed the target
    fn rebuild_source(
        &self,
        spec: &EntityTypeSpec,
        inconsistency: &Inconsistency,
        target: &GuardedStore,
        snapshot: &HealthSnapshot,
    ) -> Result<Option<StoreId>, ConsistencyError> {
        if !target.capabilities().incremental_write {
            return Ok(None);
        }
        let allowed = spec.sources_for(target.role());
        let mut candidates = Vec::new();
        for store_id in &inconsistency.present_in {
            if store_id == target.store_id() || inconsistency.divergent_in.contains(store_id) {
                continue;
            }
            let store = self.target_store(store_id, inconsistency.principal.as_ref())?;
            if allowed.contains(&store.role()) && snapshot.status_of(&store).is_available() {
                candidates.push(store);
            }
        }
        candidates.sort_by(|a, b| a.descriptor().precedence(b.descriptor()));
        Ok(candidates.first().map(|store| store.store_id().clone()))
    }

    /// Most authoritative available global store allowed to seed `target`'s role
    /// for at least one entity type
    fn store_rebuild_source(&self, target: &GuardedStore, snapshot: &HealthSnapshot) -> Option<StoreId> {
        let roles: Vec<StoreRole> = self
            .specs
            .values()
            .filter(|spec| spec.covers(target.role()))
            .flat_map(|spec| spec.sources_for(target.role()).iter().copied())
            .collect();
        let mut candidates: Vec<_> = self
            .registry
            .all()
            .into_iter()
            .filter(|store| store.descriptor().is_global())
            .filter(|store| store.store_id() != target.store_id())
            .filter(|store| roles.contains(&store.role()))
            .filter(|store| snapshot.status_of(store).is_available())
            .collect();
        candidates.sort_by(|a, b| a.descriptor().precedence(b.descriptor()));
        candidates.first().map(|store| store.store_id().clone())
    }

    /// Backup, repair and recreate candidates shared by entity and whole-store plans
    async fn push_common(
        &self,
        strategies: &mut Vec<PlannedStrategy>,
        store: &GuardedStore,
        snapshot: &HealthSnapshot,
    ) {
        match self.catalog.latest(store.store_id()).await {
            Ok(Some(backup)) => {
                let age = backup.age(Utc::now());
                let max_age = seconds(self.settings.backup_max_age_secs);
                if age <= max_age {
                    let loss = if age <= seconds(self.settings.lossless_backup_window_secs) {
                        DataLoss::None
                    } else {
                        DataLoss::Partial
                    };
                    strategies.push(PlannedStrategy {
                        backup: Some(backup),
                        ..PlannedStrategy::new(Strategy::RestoreFromBackup, loss)
                    });
                } else {
                    debug!(store = %store.store_id(), age_secs = age.num_seconds(), "latest backup too old");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(store = %store.store_id(), %err, "backup catalog lookup failed"),
        }

        if snapshot.structural_failure(store.store_id()) {
            strategies.push(PlannedStrategy::new(Strategy::RepairInPlace, DataLoss::Partial));
        }

        strategies.push(PlannedStrategy::new(Strategy::RecreateClean, DataLoss::Total));
    }
}

/// Look up a global store, or materialize `principal`'s analytics store
pub(crate) fn resolve_store(
    registry: &StoreRegistry,
    store_id: &StoreId,
    principal: Option<&PrincipalId>,
) -> Result<Arc<GuardedStore>, ConsistencyError> {
    if let Some(store) = registry.get(store_id) {
        return Ok(store);
    }
    match principal {
        Some(principal) if &StoreId::analytics_for(principal) == store_id => {
            Ok(registry.analytics(principal)?)
        }
        _ => Err(ConsistencyError::UnknownStore(store_id.clone())),
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}
