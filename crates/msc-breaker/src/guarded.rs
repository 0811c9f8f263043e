//! Store handle combining an adapter, its circuit breaker and its call timeout
//!
//! Every coordinator access to a store goes through a [`GuardedStore`]. A call
//! that exceeds the role timeout is reported as [`StoreError::Timeout`] and
//! counts against the breaker like any other store failure.

use crate::breaker::{BreakerConfig, BreakerTransition, CallError, CircuitBreaker};
use msc_store::{
    EntityId, EntityKey, EntityRecord, EntityType, Extraction, ProbeReport, StoreAdapter,
    StoreCapabilities, StoreDescriptor, StoreError, StoreId, StoreRole,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Probe result with its measured latency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub report: ProbeReport,
    pub latency: Duration,
}

/// Breaker-guarded access to one store
#[derive(Debug)]
pub struct GuardedStore {
    adapter: Arc<dyn StoreAdapter>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl GuardedStore {
    /// Wrap `adapter` with a fresh closed breaker
    #[must_use]
    pub fn new(
        adapter: Arc<dyn StoreAdapter>,
        config: BreakerConfig,
        timeout: Duration,
        transitions: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        let breaker =
            CircuitBreaker::with_channel(adapter.descriptor().store_id.clone(), config, transitions);
        Self {
            adapter,
            breaker,
            timeout,
        }
    }

    /// Static description of the store
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &StoreDescriptor {
        self.adapter.descriptor()
    }

    /// Store id
    #[inline]
    #[must_use]
    pub fn store_id(&self) -> &StoreId {
        &self.adapter.descriptor().store_id
    }

    /// Store role
    #[inline]
    #[must_use]
    pub fn role(&self) -> StoreRole {
        self.adapter.descriptor().role
    }

    /// Optional operations the adapter supports
    #[inline]
    #[must_use]
    pub fn capabilities(&self) -> StoreCapabilities {
        self.adapter.capabilities()
    }

    /// The breaker guarding this store
    #[inline]
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Per-call timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Raw adapter, bypassing the breaker
    #[inline]
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn StoreAdapter> {
        &self.adapter
    }

    /// Probe and measure latency
    pub async fn probe(&self) -> Result<ProbeOutcome, CallError> {
        let adapter = &self.adapter;
        let started = Instant::now();
        let report = self.guarded(|| adapter.probe()).await?;
        Ok(ProbeOutcome {
            report,
            latency: started.elapsed(),
        })
    }

    /// Read one record
    pub async fn read(&self, key: &EntityKey) -> Result<Option<EntityRecord>, CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.read_entity(key)).await
    }

    /// Insert or overwrite one record
    pub async fn write(&self, key: &EntityKey, record: EntityRecord) -> Result<(), CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.write_entity(key, record)).await
    }

    /// Delete one record
    pub async fn delete(&self, key: &EntityKey) -> Result<bool, CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.delete_entity(key)).await
    }

    /// List ids of one type
    pub async fn list(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.list_entities(entity_type)).await
    }

    /// Salvage decodable records
    pub async fn extract(&self) -> Result<Extraction, CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.extract()).await
    }

    /// Ensure the instance exists
    pub async fn initialize(&self) -> Result<(), CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.initialize()).await
    }

    /// Drop all data and re-initialize
    pub async fn recreate(&self) -> Result<(), CallError> {
        let adapter = &self.adapter;
        self.guarded(|| adapter.recreate()).await
    }

    async fn guarded<T, F, Fut>(&self, operation: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.timeout;
        let store_id = self.store_id();
        self.breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout {
                        store_id: store_id.clone(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use async_trait::async_trait;
    use mockall::mock;
    use msc_store::MetadataStore;

    mock! {
        Adapter {}

        #[async_trait]
        impl StoreAdapter for Adapter {
            fn descriptor(&self) -> &StoreDescriptor;
            fn capabilities(&self) -> StoreCapabilities;
            async fn probe(&self) -> Result<ProbeReport, StoreError>;
            async fn read_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StoreError>;
            async fn write_entity(&self, key: &EntityKey, record: EntityRecord) -> Result<(), StoreError>;
            async fn delete_entity(&self, key: &EntityKey) -> Result<bool, StoreError>;
            async fn list_entities(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError>;
            async fn extract(&self) -> Result<Extraction, StoreError>;
            async fn initialize(&self) -> Result<(), StoreError>;
            async fn recreate(&self) -> Result<(), StoreError>;
        }
    }

    impl std::fmt::Debug for MockAdapter {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockAdapter").finish_non_exhaustive()
        }
    }

    fn guard(adapter: Arc<dyn StoreAdapter>, threshold: u32) -> GuardedStore {
        let (tx, _) = broadcast::channel(16);
        GuardedStore::new(
            adapter,
            BreakerConfig::default().with_failure_threshold(threshold),
            Duration::from_millis(100),
            tx,
        )
    }

    fn key() -> EntityKey {
        EntityKey::new(EntityType::principal(), "p1")
    }

    #[tokio::test]
    async fn open_circuit_never_reaches_adapter() {
        let mut mock = MockAdapter::new();
        mock.expect_descriptor()
            .return_const(StoreDescriptor::global("metadata", StoreRole::Metadata, 1));
        mock.expect_read_entity()
            .times(2)
            .returning(|_| Err(StoreError::io(&StoreId::new("metadata"), "refused")));

        let store = guard(Arc::new(mock), 2);
        for _ in 0..2 {
            assert!(matches!(store.read(&key()).await, Err(CallError::Store(_))));
        }
        assert_eq!(store.breaker().state(), BreakerState::Open);

        // A third adapter call would violate `times(2)`
        assert!(store.read(&key()).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn probe_measures_latency() {
        let store = guard(Arc::new(MetadataStore::new("metadata", 1)), 5);
        let outcome = store.probe().await.unwrap();
        assert!(outcome.report.initialized);
        assert!(outcome.latency < Duration::from_secs(1));
    }

    #[derive(Debug)]
    struct Stalled(StoreDescriptor);

    #[async_trait]
    impl StoreAdapter for Stalled {
        fn descriptor(&self) -> &StoreDescriptor {
            &self.0
        }
        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities::FULL
        }
        async fn probe(&self) -> Result<ProbeReport, StoreError> {
            std::future::pending().await
        }
        async fn read_entity(&self, _key: &EntityKey) -> Result<Option<EntityRecord>, StoreError> {
            std::future::pending().await
        }
        async fn write_entity(&self, _key: &EntityKey, _record: EntityRecord) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn delete_entity(&self, _key: &EntityKey) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn list_entities(&self, _entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let stalled = Stalled(StoreDescriptor::global("artifact", StoreRole::Artifact, 3));
        let store = guard(Arc::new(stalled), 1);

        let err = store.read(&key()).await.unwrap_err();
        assert!(matches!(
            err.store_error(),
            Some(StoreError::Timeout { timeout_ms: 100, .. })
        ));
        assert_eq!(store.breaker().state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn unsupported_does_not_trip() {
        let store = guard(Arc::new(msc_store::IdentityStore::new("identity", 0)), 1);
        assert!(store.recreate().await.is_err());
        assert_eq!(store.breaker().state(), BreakerState::Closed);
    }
}
