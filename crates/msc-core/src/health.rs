//! Health monitor
//!
//! Probes every registered store through its breaker and publishes a
//! [`HealthSnapshot`] on a `watch` channel. Probe failures are absorbed by the
//! breakers; [`HealthMonitor::scan`] only errors on configuration problems.

use crate::config::HealthSettings;
use crate::error::ConsistencyError;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use msc_breaker::{
    BreakerState, BreakerTransition, CallError, GuardedStore, ProbeOutcome, StoreRegistry,
};
use msc_store::{StoreId, StoreRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Store health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthStatus {
    /// Whether the store may be read and written
    #[inline]
    #[must_use]
    pub fn is_available(self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    fn gauge(self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Degraded => 1.0,
            Self::Unavailable => 2.0,
        }
    }
}

/// Health of one store at scan time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub store_id: StoreId,
    pub role: StoreRole,
    pub status: HealthStatus,
    pub breaker: BreakerState,
    pub latency_ms: Option<u64>,
    pub initialized: bool,
    pub structural_failure: bool,
    pub warning: Option<String>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl StoreHealth {
    fn classify(
        store: &GuardedStore,
        probe: Result<ProbeOutcome, CallError>,
        latency_threshold: Duration,
    ) -> Self {
        let breaker = store.breaker().state();
        let mut health = Self {
            store_id: store.store_id().clone(),
            role: store.role(),
            status: HealthStatus::Healthy,
            breaker,
            latency_ms: None,
            initialized: false,
            structural_failure: false,
            warning: None,
            error: None,
            checked_at: Utc::now(),
        };

        match probe {
            Ok(outcome) => {
                health.latency_ms = Some(u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX));
                health.initialized = outcome.report.initialized;
                health.structural_failure = outcome.report.structural_failure;
                health.warning = outcome.report.warning;
                if outcome.latency > latency_threshold {
                    health.warning.get_or_insert_with(|| {
                        format!("probe took {}ms", outcome.latency.as_millis())
                    });
                }
                if health.warning.is_some() || health.structural_failure {
                    health.status = HealthStatus::Degraded;
                }
            }
            Err(err) => {
                health.error = Some(err.to_string());
                health.status = HealthStatus::Degraded;
            }
        }

        if breaker == BreakerState::Open {
            health.status = HealthStatus::Unavailable;
        }
        health
    }

    fn from_breaker(store: &GuardedStore) -> Self {
        let breaker = store.breaker().state();
        Self {
            store_id: store.store_id().clone(),
            role: store.role(),
            status: if breaker == BreakerState::Open {
                HealthStatus::Unavailable
            } else {
                HealthStatus::Healthy
            },
            breaker,
            latency_ms: None,
            initialized: true,
            structural_failure: false,
            warning: None,
            error: None,
            checked_at: Utc::now(),
        }
    }
}

/// Health of every store at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub stores: BTreeMap<StoreId, StoreHealth>,
}

impl HealthSnapshot {
    /// Entry for one store
    #[inline]
    #[must_use]
    pub fn get(&self, store_id: &StoreId) -> Option<&StoreHealth> {
        self.stores.get(store_id)
    }

    /// Status of one store; `None` when it was not part of the scan
    #[must_use]
    pub fn status(&self, store_id: &StoreId) -> Option<HealthStatus> {
        self.stores.get(store_id).map(|health| health.status)
    }

    /// Status of `store`, falling back to its breaker when not scanned
    ///
    /// Analytics stores materialized after the scan have no entry.
    #[must_use]
    pub fn status_of(&self, store: &GuardedStore) -> HealthStatus {
        self.status(store.store_id())
            .unwrap_or_else(|| StoreHealth::from_breaker(store).status)
    }

    /// Whether the last probe reported structural damage
    #[must_use]
    pub fn structural_failure(&self, store_id: &StoreId) -> bool {
        self.stores
            .get(store_id)
            .is_some_and(|health| health.structural_failure)
    }

    /// Worst status across all stores
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        self.stores
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Stores currently unavailable
    #[must_use]
    pub fn unavailable(&self) -> Vec<StoreId> {
        self.stores
            .values()
            .filter(|health| !health.status.is_available())
            .map(|health| health.store_id.clone())
            .collect()
    }
}

/// Periodic prober and snapshot publisher
#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<StoreRegistry>,
    latency_threshold: Duration,
    worker_pool: usize,
    snapshots: watch::Sender<Arc<HealthSnapshot>>,
}

impl HealthMonitor {
    /// Create a monitor over `registry`
    #[must_use]
    pub fn new(registry: Arc<StoreRegistry>, settings: HealthSettings, worker_pool: usize) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(HealthSnapshot::default()));
        Self {
            registry,
            latency_threshold: settings.latency_threshold(),
            worker_pool: worker_pool.max(1),
            snapshots,
        }
    }

    /// Subscribe to published snapshots
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Most recently published snapshot
    #[must_use]
    pub fn latest(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Probe every store and publish the result
    pub async fn scan(&self) -> Result<Arc<HealthSnapshot>, ConsistencyError> {
        let stores = self.registry.all();
        if stores.is_empty() {
            return Err(ConsistencyError::config("health scan over an empty registry"));
        }

        let threshold = self.latency_threshold;
        let entries: Vec<StoreHealth> = stream::iter(stores)
            .map(|store| async move {
                let probe = store.probe().await;
                StoreHealth::classify(&store, probe, threshold)
            })
            .buffer_unordered(self.worker_pool)
            .collect()
            .await;

        let mut snapshot = HealthSnapshot {
            taken_at: Some(Utc::now()),
            stores: BTreeMap::new(),
        };
        for health in entries {
            record_health(&health);
            snapshot.stores.insert(health.store_id.clone(), health);
        }

        let snapshot = Arc::new(snapshot);
        self.snapshots.send_replace(Arc::clone(&snapshot));
        debug!(stores = snapshot.stores.len(), overall = ?snapshot.overall(), "health scan published");
        Ok(snapshot)
    }

    /// React to a breaker transition by republishing the affected store
    pub fn observe_transition(&self, transition: &BreakerTransition) {
        let Some(store) = self.registry.get(&transition.store_id) else {
            return;
        };
        self.snapshots.send_modify(|current| {
            let snapshot = Arc::make_mut(current);
            let entry = snapshot
                .stores
                .entry(transition.store_id.clone())
                .or_insert_with(|| StoreHealth::from_breaker(&store));
            entry.breaker = transition.to;
            entry.checked_at = transition.at;
            if transition.to == BreakerState::Open {
                entry.status = HealthStatus::Unavailable;
            } else if entry.status == HealthStatus::Unavailable {
                entry.status = HealthStatus::Degraded;
            }
            record_health(entry);
        });
        if transition.to == BreakerState::Open {
            info!(store = %transition.store_id, "store marked unavailable after breaker opened");
        }
    }

    /// Follow breaker transitions until `shutdown` flips to true
    pub fn spawn_transition_listener(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut transitions = self.registry.subscribe_transitions();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = transitions.recv() => match event {
                        Ok(transition) => self.observe_transition(&transition),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "breaker transition listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("breaker transition listener stopped");
        })
    }
}

fn record_health(health: &StoreHealth) {
    metrics::gauge!("msc_store_health", "store" => health.store_id.to_string())
        .set(health.status.gauge());
    if health.status == HealthStatus::Degraded {
        let reason = health
            .warning
            .clone()
            .or_else(|| health.error.clone())
            .unwrap_or_default();
        warn!(
            error = %ConsistencyError::StoreDegraded { store_id: health.store_id.clone(), reason },
            "store degraded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msc_breaker::BreakerConfig;
    use msc_store::{AnalyticsStore, MetadataStore, PrincipalId, StoreAdapter};

    fn registry(threshold: u32) -> Arc<StoreRegistry> {
        Arc::new(
            StoreRegistry::builder()
                .breaker_config(BreakerConfig::default().with_failure_threshold(threshold))
                .store(Arc::new(MetadataStore::new("metadata", 1)))
                .analytics_factory(2, |p| {
                    Arc::new(AnalyticsStore::new(p.clone(), 2)) as Arc<dyn StoreAdapter>
                })
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn healthy_and_unmaterialized_stores() {
        let registry = registry(5);
        registry.analytics(&PrincipalId::new("p1")).unwrap();
        let monitor = HealthMonitor::new(Arc::clone(&registry), HealthSettings::default(), 4);

        let snapshot = monitor.scan().await.unwrap();
        assert_eq!(snapshot.status(&StoreId::new("metadata")), Some(HealthStatus::Healthy));
        // An analytics instance that was never written reports a warning
        assert_eq!(
            snapshot.status(&StoreId::new("analytics:p1")),
            Some(HealthStatus::Degraded)
        );
        assert_eq!(*monitor.latest(), *snapshot);
    }

    #[tokio::test]
    async fn open_breaker_is_unavailable() {
        let registry = registry(5);
        let metadata = registry.get(&StoreId::new("metadata")).unwrap();
        metadata.breaker().force_open(tokio::time::Instant::now());

        let monitor = HealthMonitor::new(registry, HealthSettings::default(), 4);
        let snapshot = monitor.scan().await.unwrap();
        let health = snapshot.get(&StoreId::new("metadata")).unwrap();
        assert_eq!(health.status, HealthStatus::Unavailable);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn transition_republishes_snapshot() {
        let registry = registry(5);
        let monitor = Arc::new(HealthMonitor::new(Arc::clone(&registry), HealthSettings::default(), 4));
        monitor.scan().await.unwrap();
        let mut rx = monitor.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = Arc::clone(&monitor).spawn_transition_listener(shutdown_rx);
        tokio::task::yield_now().await;

        registry
            .get(&StoreId::new("metadata"))
            .unwrap()
            .breaker()
            .force_open(tokio::time::Instant::now());

        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().status(&StoreId::new("metadata")),
            Some(HealthStatus::Unavailable)
        );

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn empty_registry_is_config_error() {
        let registry = Arc::new(
            StoreRegistry::builder()
                .analytics_factory(2, |p| {
                    Arc::new(AnalyticsStore::new(p.clone(), 2)) as Arc<dyn StoreAdapter>
                })
                .build()
                .unwrap(),
        );
        let monitor = HealthMonitor::new(registry, HealthSettings::default(), 1);
        assert!(matches!(monitor.scan().await, Err(ConsistencyError::Config(_))));
    }
}
