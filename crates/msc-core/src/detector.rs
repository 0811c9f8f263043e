//! Inconsistency detector
//!
//! Cross-references each known entity across every store relevant to its type.
//! All reads go through the breakers. Stores that are unavailable in the pass
//! snapshot (or fail mid-pass) are excluded and the finding is marked stale
//! rather than reported as a false positive.

use crate::config::{EntityTypeSpec, Ownership};
use crate::error::ConsistencyError;
use crate::health::HealthSnapshot;
use crate::ids::InconsistencyId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use msc_breaker::{GuardedStore, StoreRegistry};
use msc_store::{
    EntityId, EntityKey, EntityRecord, EntityRef, EntityType, PrincipalId, StoreId, StoreRole,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Inconsistency severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

/// A cross-store disagreement about one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inconsistency {
    pub id: InconsistencyId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub principal: Option<PrincipalId>,
    pub present_in: BTreeSet<StoreId>,
    pub missing_in: BTreeSet<StoreId>,
    /// Stores holding the entity with a sub-entity count out of tolerance
    pub divergent_in: BTreeSet<StoreId>,
    pub sub_entity_counts: BTreeMap<StoreId, u64>,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// Some relevant stores were excluded from the comparison
    pub stale: bool,
    pub excluded: BTreeSet<StoreId>,
}

impl Inconsistency {
    /// Storage key of the entity
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
    }

    /// Stores needing repair
    #[must_use]
    pub fn targets(&self) -> BTreeSet<StoreId> {
        self.missing_in.union(&self.divergent_in).cloned().collect()
    }

    /// Same entity and the same disagreement, regardless of pass
    #[must_use]
    pub fn same_finding(&self, other: &Inconsistency) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.missing_in == other.missing_in
            && self.divergent_in == other.divergent_in
    }
}

/// Source of the entity ids to cross-reference
#[async_trait]
pub trait KnownEntities: Send + Sync + std::fmt::Debug {
    /// Entities of `spec`'s type to check in this pass
    async fn known(
        &self,
        spec: &EntityTypeSpec,
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<EntityRef>, ConsistencyError>;
}

/// Lists ids from every available relevant store and unions them
#[derive(Debug)]
pub struct StoreListing {
    registry: Arc<StoreRegistry>,
}

impl StoreListing {
    /// Create a listing source over `registry`
    #[inline]
    #[must_use]
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl KnownEntities for StoreListing {
    async fn known(
        &self,
        spec: &EntityTypeSpec,
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<EntityRef>, ConsistencyError> {
        let mut stores: Vec<_> = self
            .registry
            .relevant(&spec.roles, None)?
            .into_iter()
            .collect();
        if spec.covers(StoreRole::Analytics) {
            stores.extend(self.registry.active_analytics());
        }

        let mut refs: BTreeMap<EntityId, Option<PrincipalId>> = BTreeMap::new();
        for store in stores {
            if !snapshot.status_of(&store).is_available() {
                continue;
            }
            let ids = match store.list(&spec.name).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(store = %store.store_id(), entity_type = %spec.name, %err, "listing failed");
                    continue;
                }
            };
            let scope = store.descriptor().principal_scope.clone();
            for id in ids {
                let principal = match &spec.owner {
                    Ownership::SelfPrincipal => Some(PrincipalId::new(id.as_str())),
                    Ownership::Field(_) => scope.clone(),
                    Ownership::Unscoped => None,
                };
                let slot = refs.entry(id).or_default();
                if slot.is_none() {
                    *slot = principal;
                }
            }
        }

        Ok(refs
            .into_iter()
            .map(|(id, principal)| EntityRef { id, principal })
            .collect())
    }
}

enum Observation {
    Present(EntityRecord),
    Missing,
    Excluded,
}

/// Cross-store entity comparison
#[derive(Debug)]
pub struct InconsistencyDetector {
    registry: Arc<StoreRegistry>,
    specs: BTreeMap<EntityType, EntityTypeSpec>,
    known: Arc<dyn KnownEntities>,
    worker_pool: usize,
}

impl InconsistencyDetector {
    /// Create a detector for `specs`
    #[must_use]
    pub fn new(
        registry: Arc<StoreRegistry>,
        specs: Vec<EntityTypeSpec>,
        known: Arc<dyn KnownEntities>,
        worker_pool: usize,
    ) -> Self {
        Self {
            registry,
            specs: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
            known,
            worker_pool: worker_pool.max(1),
        }
    }

    /// Spec for `entity_type`
    #[inline]
    #[must_use]
    pub fn spec(&self, entity_type: &EntityType) -> Option<&EntityTypeSpec> {
        self.specs.get(entity_type)
    }

    /// Check `known_ids` of one type against `snapshot`
    pub async fn scan(
        &self,
        entity_type: &EntityType,
        known_ids: &[EntityRef],
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<Inconsistency>, ConsistencyError> {
        if entity_type.is_reserved() {
            return Ok(Vec::new());
        }
        let spec = self.specs.get(entity_type).ok_or_else(|| {
            ConsistencyError::config(format!("no spec for entity type {entity_type}"))
        })?;

        let checked: Vec<Option<Inconsistency>> = stream::iter(known_ids.iter().cloned())
            .map(|entity| async move { self.check(spec, &entity, snapshot).await })
            .buffer_unordered(self.worker_pool)
            .try_collect()
            .await?;
        let mut found: Vec<Inconsistency> = checked.into_iter().flatten().collect();
        found.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        debug!(entity_type = %entity_type, checked = known_ids.len(), found = found.len(), "entity type scanned");
        Ok(found)
    }

    /// Scan several entity types concurrently against one snapshot
    pub async fn detect_pass(
        &self,
        snapshot: &HealthSnapshot,
        work: Vec<(EntityType, Vec<EntityRef>)>,
    ) -> Result<Vec<Inconsistency>, ConsistencyError> {
        let batches: Vec<Vec<Inconsistency>> = stream::iter(work)
            .map(|(entity_type, refs)| async move {
                self.scan(&entity_type, &refs, snapshot).await
            })
            .buffer_unordered(self.worker_pool)
            .try_collect()
            .await?;

        let mut found: Vec<_> = batches.into_iter().flatten().collect();
        found.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id).cmp(&(&b.entity_type, &b.entity_id))
        });
        metrics::gauge!("msc_open_inconsistencies").set(found.len() as f64);
        Ok(found)
    }

    /// Scan every configured entity type using the known-entities source
    pub async fn detect_all(
        &self,
        snapshot: &HealthSnapshot,
    ) -> Result<Vec<Inconsistency>, ConsistencyError> {
        let mut work = Vec::with_capacity(self.specs.len());
        for spec in self.specs.values() {
            let refs = self.known.known(spec, snapshot).await?;
            work.push((spec.name.clone(), refs));
        }
        self.detect_pass(snapshot, work).await
    }

    async fn observe(store: &GuardedStore, key: &EntityKey, snapshot: &HealthSnapshot) -> Observation {
        if !snapshot.status_of(store).is_available() {
            return Observation::Excluded;
        }
        match store.read(key).await {
            Ok(Some(record)) => Observation::Present(record),
            Ok(None) => Observation::Missing,
            Err(err) => {
                debug!(store = %store.store_id(), %key, %err, "read failed, excluding store");
                Observation::Excluded
            }
        }
    }

    async fn check(
        &self,
        spec: &EntityTypeSpec,
        entity: &EntityRef,
        snapshot: &HealthSnapshot,
    ) -> Result<Option<Inconsistency>, ConsistencyError> {
        let key = EntityKey::new(spec.name.clone(), entity.id.clone());

        let globals = self.registry.relevant(&spec.roles, None)?;
        let mut observed: Vec<(Arc<GuardedStore>, Observation)> = globals
            .iter()
            .zip(join_all(globals.iter().map(|store| Self::observe(store, &key, snapshot))).await)
            .map(|(store, observation)| (Arc::clone(store), observation))
            .collect();

        let principal = entity
            .principal
            .clone()
            .or_else(|| resolve_owner(spec, &observed));
        if spec.covers(StoreRole::Analytics) && self.registry.has_analytics() {
            if let Some(principal) = &principal {
                let store = self.registry.analytics(principal)?;
                let observation = Self::observe(&store, &key, snapshot).await;
                observed.push((store, observation));
            }
        }
        observed.sort_by(|(a, _), (b, _)| a.descriptor().precedence(b.descriptor()));

        Ok(compare(spec, &key, principal, &observed))
    }
}

fn resolve_owner(
    spec: &EntityTypeSpec,
    observed: &[(Arc<GuardedStore>, Observation)],
) -> Option<PrincipalId> {
    let Ownership::Field(field) = &spec.owner else {
        return None;
    };
    observed.iter().find_map(|(_, observation)| match observation {
        Observation::Present(record) => record
            .data
            .get(field)
            .and_then(|value| value.as_str())
            .map(PrincipalId::new),
        _ => None,
    })
}

/// Decide whether `observed` (sorted by precedence) disagrees
fn compare(
    spec: &EntityTypeSpec,
    key: &EntityKey,
    principal: Option<PrincipalId>,
    observed: &[(Arc<GuardedStore>, Observation)],
) -> Option<Inconsistency> {
    let mut present_in = BTreeSet::new();
    let mut missing_in = BTreeSet::new();
    let mut excluded = BTreeSet::new();
    let mut counts = BTreeMap::new();
    let mut most_authoritative: Option<&StoreId> = None;
    let mut reference: Option<u64> = None;

    for (store, observation) in observed {
        let store_id = store.store_id();
        let counted = spec.counts(store.role());
        match observation {
            Observation::Excluded => {
                excluded.insert(store_id.clone());
                continue;
            }
            Observation::Present(record) => {
                present_in.insert(store_id.clone());
                if counted {
                    counts.insert(store_id.clone(), record.sub_entity_count);
                    reference.get_or_insert(record.sub_entity_count);
                }
            }
            Observation::Missing => {
                missing_in.insert(store_id.clone());
                if counted {
                    counts.insert(store_id.clone(), 0);
                }
            }
        }
        most_authoritative.get_or_insert(store_id);
    }

    if present_in.is_empty() {
        return None;
    }

    let beyond = |count: u64| {
        reference.is_some_and(|reference| count.abs_diff(reference) > spec.sub_entity_tolerance)
    };
    let divergent_in: BTreeSet<StoreId> = counts
        .iter()
        .filter(|(store_id, count)| present_in.contains(*store_id) && beyond(**count))
        .map(|(store_id, _)| store_id.clone())
        .collect();

    if missing_in.is_empty() && divergent_in.is_empty() {
        return None;
    }

    // a copy missing from a counted store loses every sub-entity it held
    let counted_copy_missing = missing_in.iter().any(|store_id| counts.contains_key(store_id));
    let severity = if most_authoritative.is_some_and(|id| missing_in.contains(id)) {
        Severity::Critical
    } else if counted_copy_missing || counts.values().any(|count| beyond(*count)) {
        Severity::Major
    } else {
        Severity::Minor
    };

    let stale = !excluded.is_empty();
    Some(Inconsistency {
        id: InconsistencyId::new(),
        entity_type: key.entity_type.clone(),
        entity_id: key.id.clone(),
        principal,
        present_in,
        missing_in,
        divergent_in,
        sub_entity_counts: counts,
        severity,
        detected_at: Utc::now(),
        stale,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthMonitor;
    use crate::config::HealthSettings;
    use msc_store::{AnalyticsStore, IdentityStore, MemoryTable, MetadataStore, StoreAdapter};
    use pretty_assertions::assert_eq;

    struct Fixture {
        identity: Arc<MemoryTable>,
        metadata: Arc<MemoryTable>,
        analytics: Arc<dashmap::DashMap<PrincipalId, Arc<MemoryTable>>>,
        registry: Arc<StoreRegistry>,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryTable::new());
        let metadata = Arc::new(MemoryTable::new());
        let analytics: Arc<dashmap::DashMap<PrincipalId, Arc<MemoryTable>>> = Arc::default();
        let tables = Arc::clone(&analytics);
        let registry = StoreRegistry::builder()
            .store(Arc::new(IdentityStore::with_table("identity", 0, Arc::clone(&identity))))
            .store(Arc::new(MetadataStore::with_table("metadata", 1, Arc::clone(&metadata))))
            .analytics_factory(2, move |p| {
                let table = Arc::clone(
                    tables
                        .entry(p.clone())
                        .or_insert_with(|| Arc::new(MemoryTable::uninitialized()))
                        .value(),
                );
                Arc::new(AnalyticsStore::with_table(p.clone(), 2, table)) as Arc<dyn StoreAdapter>
            })
            .build()
            .unwrap();
        Fixture {
            identity,
            metadata,
            analytics,
            registry: Arc::new(registry),
        }
    }

    impl Fixture {
        fn detector(&self) -> InconsistencyDetector {
            self.detector_with(EntityTypeSpec::builtins())
        }

        fn detector_with(&self, specs: Vec<EntityTypeSpec>) -> InconsistencyDetector {
            InconsistencyDetector::new(
                Arc::clone(&self.registry),
                specs,
                Arc::new(StoreListing::new(Arc::clone(&self.registry))),
                4,
            )
        }

        async fn snapshot(&self) -> Arc<HealthSnapshot> {
            HealthMonitor::new(Arc::clone(&self.registry), HealthSettings::default(), 4)
                .scan()
                .await
                .unwrap()
        }

        fn analytics_table(&self, principal: &str) -> Arc<MemoryTable> {
            Arc::clone(
                self.analytics
                    .entry(PrincipalId::new(principal))
                    .or_insert_with(|| Arc::new(MemoryTable::uninitialized()))
                    .value(),
            )
        }
    }

    fn principal_key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::principal(), id)
    }

    fn record(count: u64) -> EntityRecord {
        EntityRecord::new(serde_json::json!({"name": "p"})).with_sub_entities(count)
    }

    #[tokio::test]
    async fn missing_analytics_copy_is_major() {
        let fx = fixture();
        fx.identity.write(&principal_key("p1"), record(0));
        fx.metadata.write(&principal_key("p1"), record(3));

        let snapshot = fx.snapshot().await;
        let found = fx
            .detector()
            .scan(&EntityType::principal(), &[EntityRef::principal("p1")], &snapshot)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        let inc = &found[0];
        assert_eq!(
            inc.missing_in,
            BTreeSet::from([StoreId::new("analytics:p1")])
        );
        assert_eq!(inc.severity, Severity::Major);
        assert!(!inc.stale);
    }

    #[tokio::test]
    async fn missing_in_most_authoritative_is_critical() {
        let fx = fixture();
        fx.metadata.write(&principal_key("p1"), record(0));
        fx.analytics_table("p1").write(&principal_key("p1"), record(0));

        let snapshot = fx.snapshot().await;
        let found = fx
            .detector()
            .scan(&EntityType::principal(), &[EntityRef::principal("p1")], &snapshot)
            .await
            .unwrap();
        assert_eq!(found[0].severity, Severity::Critical);
        assert_eq!(found[0].missing_in, BTreeSet::from([StoreId::new("identity")]));
    }

    #[tokio::test]
    async fn missing_counted_copy_is_major_without_sub_entities() {
        let fx = fixture();
        fx.identity.write(&principal_key("p1"), record(0));
        fx.metadata.write(&principal_key("p1"), record(0));

        let snapshot = fx.snapshot().await;
        let found = fx
            .detector()
            .scan(&EntityType::principal(), &[EntityRef::principal("p1")], &snapshot)
            .await
            .unwrap();
        assert_eq!(found[0].missing_in, BTreeSet::from([StoreId::new("analytics:p1")]));
        assert_eq!(found[0].severity, Severity::Major);
    }

    #[tokio::test]
    async fn missing_uncounted_copy_is_minor() {
        let fx = fixture();
        fx.identity.write(&principal_key("p1"), record(0));
        fx.metadata.write(&principal_key("p1"), record(0));
        let specs = EntityTypeSpec::builtins()
            .into_iter()
            .map(|spec| {
                if spec.name == EntityType::principal() {
                    spec.with_counted_roles(Vec::new())
                } else {
                    spec
                }
            })
            .collect();

        let snapshot = fx.snapshot().await;
        let found = fx
            .detector_with(specs)
            .scan(&EntityType::principal(), &[EntityRef::principal("p1")], &snapshot)
            .await
            .unwrap();
        assert_eq!(found[0].severity, Severity::Minor);
    }

    #[tokio::test]
    async fn divergent_counts_without_missing_copy() {
        let fx = fixture();
        fx.identity.write(&principal_key("p1"), record(0));
        fx.metadata.write(&principal_key("p1"), record(4));
        fx.analytics_table("p1").write(&principal_key("p1"), record(2));

        let snapshot = fx.snapshot().await;
        let found = fx
            .detector()
            .scan(&EntityType::principal(), &[EntityRef::principal("p1")], &snapshot)
            .await
            .unwrap();
        let inc = &found[0];
        assert!(inc.missing_in.is_empty());
        assert_eq!(inc.divergent_in, BTreeSet::from([StoreId::new("analytics:p1")]));
        assert_eq!(inc.severity, Severity::Major);
    }

    #[tokio::test]
    async fn consistent_entity_yields_nothing() {
        let fx = fixture();
        fx.identity.write(&principal_key("p1"), record(0));
        fx.metadata.write(&principal_key("p1"), record(2));
        fx.analytics_table("p1").write(&principal_key("p1"), record(2));

        let snapshot = fx.snapshot().await;
        let found = fx.detector().detect_all(&snapshot).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_marks_finding_stale() {
        let fx = fixture();
        fx.identity.write(&principal_key("p1"), record(0));
        fx.metadata.write(&principal_key("p1"), record(1));
        fx.registry
            .get(&StoreId::new("identity"))
            .unwrap()
            .breaker()
            .force_open(tokio::time::Instant::now());

        let snapshot = fx.snapshot().await;
        let found = fx
            .detector()
            .scan(&EntityType::principal(), &[EntityRef::principal("p1")], &snapshot)
            .await
            .unwrap();
        let inc = &found[0];
        assert!(inc.stale);
        assert_eq!(inc.excluded, BTreeSet::from([StoreId::new("identity")]));
        assert!(!inc.missing_in.contains(&StoreId::new("identity")));
    }

    #[tokio::test]
    async fn execution_owner_resolved_from_record_field() {
        let fx = fixture();
        let key = EntityKey::new(EntityType::execution(), "e1");
        fx.metadata.write(
            &key,
            EntityRecord::new(serde_json::json!({"principal": "p7"})),
        );

        let snapshot = fx.snapshot().await;
        let found = fx.detector().detect_all(&snapshot).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].principal, Some(PrincipalId::new("p7")));
        assert_eq!(found[0].missing_in, BTreeSet::from([StoreId::new("analytics:p7")]));
    }

    #[tokio::test]
    async fn reserved_types_are_skipped() {
        let fx = fixture();
        let snapshot = fx.snapshot().await;
        let found = fx
            .detector()
            .scan(&EntityType::reserved("breaker"), &[EntityRef::unscoped("x")], &snapshot)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
