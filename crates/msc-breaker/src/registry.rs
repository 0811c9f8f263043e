//! Store registry
//!
//! Holds one [`GuardedStore`] per global store plus the lazily materialized
//! per-principal analytics stores. All breakers publish on one shared
//! transition channel.

use crate::breaker::{BreakerConfig, BreakerTransition};
use crate::guarded::GuardedStore;
use dashmap::DashMap;
use msc_store::{PrincipalId, StoreAdapter, StoreId, StoreRole};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Builds the analytics adapter for a principal on first access
pub type AnalyticsFactory = Arc<dyn Fn(&PrincipalId) -> Arc<dyn StoreAdapter> + Send + Sync>;

/// Registry configuration error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("store {0} registered twice")]
    DuplicateStore(StoreId),

    #[error("authority rank {rank} shared by {first} and {second}")]
    DuplicateRank {
        rank: u32,
        first: StoreId,
        second: StoreId,
    },

    #[error("store {0} is principal-scoped; register an analytics factory instead")]
    PrincipalScoped(StoreId),

    #[error("no analytics factory registered")]
    NoAnalyticsFactory,

    #[error("registry has no stores")]
    Empty,
}

/// Per-role call timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleTimeouts {
    pub identity: Duration,
    pub metadata: Duration,
    pub analytics: Duration,
    pub artifact: Duration,
}

impl Default for RoleTimeouts {
    fn default() -> Self {
        Self {
            identity: StoreRole::Identity.default_timeout(),
            metadata: StoreRole::Metadata.default_timeout(),
            analytics: StoreRole::Analytics.default_timeout(),
            artifact: StoreRole::Artifact.default_timeout(),
        }
    }
}

impl RoleTimeouts {
    /// Timeout applied to calls against `role`
    #[inline]
    #[must_use]
    pub fn for_role(&self, role: StoreRole) -> Duration {
        match role {
            StoreRole::Identity => self.identity,
            StoreRole::Metadata => self.metadata,
            StoreRole::Analytics => self.analytics,
            StoreRole::Artifact => self.artifact,
        }
    }
}

struct AnalyticsSource {
    rank: u32,
    factory: AnalyticsFactory,
}

/// Builder for [`StoreRegistry`]
pub struct StoreRegistryBuilder {
    breaker: BreakerConfig,
    timeouts: RoleTimeouts,
    stores: Vec<Arc<dyn StoreAdapter>>,
    analytics: Option<AnalyticsSource>,
    channel_capacity: usize,
}

impl Default for StoreRegistryBuilder {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            timeouts: RoleTimeouts::default(),
            stores: Vec::new(),
            analytics: None,
            channel_capacity: 256,
        }
    }
}

impl StoreRegistryBuilder {
    /// Breaker thresholds for every store
    #[inline]
    #[must_use]
    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Per-role call timeouts
    #[inline]
    #[must_use]
    pub fn timeouts(mut self, timeouts: RoleTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Register a global store
    #[inline]
    #[must_use]
    pub fn store(mut self, adapter: Arc<dyn StoreAdapter>) -> Self {
        self.stores.push(adapter);
        self
    }

    /// Register the factory for per-principal analytics stores
    #[inline]
    #[must_use]
    pub fn analytics_factory<F>(mut self, authority_rank: u32, factory: F) -> Self
    where
        F: Fn(&PrincipalId) -> Arc<dyn StoreAdapter> + Send + Sync + 'static,
    {
        self.analytics = Some(AnalyticsSource {
            rank: authority_rank,
            factory: Arc::new(factory),
        });
        self
    }

    /// Capacity of the transition broadcast channel
    #[inline]
    #[must_use]
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<StoreRegistry, RegistryError> {
        if self.stores.is_empty() && self.analytics.is_none() {
            return Err(RegistryError::Empty);
        }

        let (transitions, _) = broadcast::channel(self.channel_capacity);
        let mut globals: BTreeMap<StoreId, Arc<GuardedStore>> = BTreeMap::new();
        let mut ranks: BTreeMap<u32, StoreId> = BTreeMap::new();
        if let Some(source) = &self.analytics {
            ranks.insert(source.rank, StoreId::new("analytics:*"));
        }

        for adapter in self.stores {
            let descriptor = adapter.descriptor().clone();
            if !descriptor.is_global() || descriptor.role.is_principal_scoped() {
                return Err(RegistryError::PrincipalScoped(descriptor.store_id));
            }
            if globals.contains_key(&descriptor.store_id) {
                return Err(RegistryError::DuplicateStore(descriptor.store_id));
            }
            if let Some(first) = ranks.get(&descriptor.authority_rank) {
                return Err(RegistryError::DuplicateRank {
                    rank: descriptor.authority_rank,
                    first: first.clone(),
                    second: descriptor.store_id,
                });
            }
            ranks.insert(descriptor.authority_rank, descriptor.store_id.clone());

            let guarded = GuardedStore::new(
                adapter,
                self.breaker,
                self.timeouts.for_role(descriptor.role),
                transitions.clone(),
            );
            globals.insert(descriptor.store_id, Arc::new(guarded));
        }

        tracing::debug!(
            globals = globals.len(),
            analytics = self.analytics.is_some(),
            "store registry built"
        );

        Ok(StoreRegistry {
            globals,
            analytics: DashMap::new(),
            analytics_source: self.analytics,
            breaker: self.breaker,
            timeouts: self.timeouts,
            transitions,
        })
    }
}

/// All stores known to the coordinator
pub struct StoreRegistry {
    globals: BTreeMap<StoreId, Arc<GuardedStore>>,
    analytics: DashMap<PrincipalId, Arc<GuardedStore>>,
    analytics_source: Option<AnalyticsSource>,
    breaker: BreakerConfig,
    timeouts: RoleTimeouts,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("globals", &self.globals.keys().collect::<Vec<_>>())
            .field("analytics", &self.analytics.len())
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl StoreRegistry {
    /// Start building a registry
    #[inline]
    #[must_use]
    pub fn builder() -> StoreRegistryBuilder {
        StoreRegistryBuilder::default()
    }

    /// Breaker thresholds in force
    #[inline]
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        self.breaker
    }

    /// Subscribe to breaker transitions of every store
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Whether analytics stores can be materialized
    #[inline]
    #[must_use]
    pub fn has_analytics(&self) -> bool {
        self.analytics_source.is_some()
    }

    /// Look up any materialized store by id
    #[must_use]
    pub fn get(&self, store_id: &StoreId) -> Option<Arc<GuardedStore>> {
        if let Some(store) = self.globals.get(store_id) {
            return Some(Arc::clone(store));
        }
        self.analytics
            .iter()
            .find(|entry| entry.value().store_id() == store_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Global stores of `role`, most authoritative first
    #[must_use]
    pub fn global(&self, role: StoreRole) -> Vec<Arc<GuardedStore>> {
        let mut stores: Vec<_> = self
            .globals
            .values()
            .filter(|store| store.role() == role)
            .cloned()
            .collect();
        stores.sort_by(|a, b| a.descriptor().precedence(b.descriptor()));
        stores
    }

    /// Most authoritative global store of `role`
    #[must_use]
    pub fn primary(&self, role: StoreRole) -> Option<Arc<GuardedStore>> {
        self.global(role).into_iter().next()
    }

    /// Analytics store of `principal`, materialized on first access
    pub fn analytics(&self, principal: &PrincipalId) -> Result<Arc<GuardedStore>, RegistryError> {
        if let Some(store) = self.analytics.get(principal) {
            return Ok(Arc::clone(store.value()));
        }
        let source = self
            .analytics_source
            .as_ref()
            .ok_or(RegistryError::NoAnalyticsFactory)?;
        let entry = self.analytics.entry(principal.clone()).or_insert_with(|| {
            tracing::debug!(%principal, "materializing analytics store handle");
            let adapter = (source.factory)(principal);
            Arc::new(GuardedStore::new(
                adapter,
                self.breaker,
                self.timeouts.analytics,
                self.transitions.clone(),
            ))
        });
        Ok(Arc::clone(entry.value()))
    }

    /// Authority rank assigned to analytics stores
    #[must_use]
    pub fn analytics_rank(&self) -> Option<u32> {
        self.analytics_source.as_ref().map(|source| source.rank)
    }

    /// Analytics stores materialized so far
    #[must_use]
    pub fn active_analytics(&self) -> Vec<Arc<GuardedStore>> {
        let mut stores: Vec<_> = self
            .analytics
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stores.sort_by(|a, b| a.store_id().cmp(b.store_id()));
        stores
    }

    /// Forget a principal's analytics store handle
    pub fn remove_principal(&self, principal: &PrincipalId) -> bool {
        self.analytics.remove(principal).is_some()
    }

    /// Every materialized store, globals by precedence then analytics by id
    #[must_use]
    pub fn all(&self) -> Vec<Arc<GuardedStore>> {
        let mut stores: Vec<_> = self.globals.values().cloned().collect();
        stores.sort_by(|a, b| a.descriptor().precedence(b.descriptor()));
        stores.extend(self.active_analytics());
        stores
    }

    /// Stores holding `roles`, with `principal`'s analytics store when requested
    ///
    /// Result is ordered by authority precedence.
    pub fn relevant(
        &self,
        roles: &[StoreRole],
        principal: Option<&PrincipalId>,
    ) -> Result<Vec<Arc<GuardedStore>>, RegistryError> {
        let wanted: HashSet<StoreRole> = roles.iter().copied().collect();
        let mut stores: Vec<_> = self
            .globals
            .values()
            .filter(|store| wanted.contains(&store.role()))
            .cloned()
            .collect();
        if wanted.contains(&StoreRole::Analytics) && self.has_analytics() {
            if let Some(principal) = principal {
                stores.push(self.analytics(principal)?);
            }
        }
        stores.sort_by(|a, b| a.descriptor().precedence(b.descriptor()));
        Ok(stores)
    }

    /// Number of materialized stores
    #[must_use]
    pub fn len(&self) -> usize {
        self.globals.len() + self.analytics.len()
    }

    /// Whether no store is materialized
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
