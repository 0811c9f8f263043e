//! Store registry construction from configuration

use msc_breaker::StoreRegistry;
use msc_core::{ConsistencyConfig, ConsistencyError};
use msc_store::{
    AnalyticsStore, ArtifactStore, IdentityStore, MetadataStore, StoreAdapter, StoreRole,
};
use std::sync::Arc;
use tracing::info;

/// Build the registry described by `config.topology`
///
/// Identity and metadata roles get in-process adapters, artifact stores live
/// under their configured directory, and analytics stores are materialized per
/// principal on first use.
pub fn build_registry(config: &ConsistencyConfig) -> Result<StoreRegistry, ConsistencyError> {
    config.topology.validate()?;

    let mut builder = StoreRegistry::builder()
        .breaker_config(config.breaker_config())
        .timeouts(config.role_timeouts());

    for store in &config.topology.stores {
        let adapter: Arc<dyn StoreAdapter> = match store.role {
            StoreRole::Identity => Arc::new(IdentityStore::new(store.id.clone(), store.rank)),
            StoreRole::Metadata => Arc::new(MetadataStore::new(store.id.clone(), store.rank)),
            StoreRole::Artifact => {
                let root = store.path.clone().ok_or_else(|| {
                    ConsistencyError::config(format!("artifact store {} needs a path", store.id))
                })?;
                Arc::new(ArtifactStore::new(store.id.clone(), store.rank, root))
            }
            StoreRole::Analytics => {
                return Err(ConsistencyError::config(format!(
                    "store {} is principal-scoped; use topology.analytics_rank",
                    store.id
                )))
            }
        };
        info!(store = %store.id, role = ?store.role, rank = store.rank, "store registered");
        builder = builder.store(adapter);
    }

    if let Some(rank) = config.topology.analytics_rank {
        builder = builder.analytics_factory(rank, move |principal| {
            Arc::new(AnalyticsStore::new(principal.clone(), rank)) as Arc<dyn StoreAdapter>
        });
    }

    Ok(builder.build()?)
}
