//! Durable coordinator state in the metadata store
//!
//! Reserved entity types:
//! - `__msc.breaker`: one record per store, the [`CircuitBreakerState`]
//! - `__msc.inconsistency`: the bounded detection history
//! - `__msc.recovery`: one record per terminal recovery attempt
//! - `__msc.transaction`: one record per terminal transaction
//!
//! Writes go through the metadata store's breaker like any other call.

use crate::audit::DetectionPass;
use crate::error::ConsistencyError;
use crate::executor::RecoveryAttempt;
use crate::transaction::TransactionRecord;
use chrono::{DateTime, Utc};
use msc_breaker::{CircuitBreakerState, GuardedStore, StoreRegistry};
use msc_store::{EntityKey, EntityRecord, EntityType, StoreRole};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use ulid::Ulid;

/// Reserved namespaces
pub mod namespace {
    /// Breaker states
    pub const BREAKER: &str = "breaker";
    /// Detection history
    pub const INCONSISTENCY: &str = "inconsistency";
    /// Recovery audit
    pub const RECOVERY: &str = "recovery";
    /// Transaction audit
    pub const TRANSACTION: &str = "transaction";
}

const HISTORY_ID: &str = "history";

/// Reads and writes coordinator state
#[derive(Debug)]
pub struct StateStore {
    registry: Arc<StoreRegistry>,
}

impl StateStore {
    /// Create a state store backed by the registry's primary metadata store
    #[inline]
    #[must_use]
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self { registry }
    }

    fn metadata(&self) -> Result<Arc<GuardedStore>, ConsistencyError> {
        self.registry
            .primary(StoreRole::Metadata)
            .ok_or_else(|| ConsistencyError::Persistence("no metadata store registered".to_string()))
    }

    async fn save<T: Serialize>(
        &self,
        namespace: &str,
        id: &str,
        value: &T,
    ) -> Result<(), ConsistencyError> {
        let data = serde_json::to_value(value)
            .map_err(|e| ConsistencyError::Persistence(e.to_string()))?;
        let key = EntityKey::new(EntityType::reserved(namespace), id);
        self.metadata()?.write(&key, EntityRecord::new(data)).await?;
        Ok(())
    }

    async fn load<T: DeserializeOwned>(
        &self,
        namespace: &str,
        id: &str,
    ) -> Result<Option<T>, ConsistencyError> {
        let key = EntityKey::new(EntityType::reserved(namespace), id);
        match self.metadata()?.read(&key).await? {
            Some(record) => serde_json::from_value(record.data)
                .map(Some)
                .map_err(|e| ConsistencyError::Persistence(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn load_all<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>, ConsistencyError> {
        let metadata = self.metadata()?;
        let entity_type = EntityType::reserved(namespace);
        let mut values = Vec::new();
        for id in metadata.list(&entity_type).await? {
            let key = EntityKey::new(entity_type.clone(), id);
            let Some(record) = metadata.read(&key).await? else {
                continue;
            };
            match serde_json::from_value(record.data) {
                Ok(value) => values.push(value),
                Err(err) => warn!(%key, %err, "skipping undecodable state record"),
            }
        }
        Ok(values)
    }

    /// Persist breaker states
    pub async fn save_breakers(&self, states: &[CircuitBreakerState]) -> Result<(), ConsistencyError> {
        for state in states {
            self.save(namespace::BREAKER, state.store_id.as_str(), state)
                .await?;
        }
        Ok(())
    }

    /// Load every persisted breaker state
    pub async fn load_breakers(&self) -> Result<Vec<CircuitBreakerState>, ConsistencyError> {
        self.load_all(namespace::BREAKER).await
    }

    /// Persist the detection history
    pub async fn save_history(&self, passes: &[DetectionPass]) -> Result<(), ConsistencyError> {
        self.save(namespace::INCONSISTENCY, HISTORY_ID, &passes).await
    }

    /// Load the detection history
    pub async fn load_history(&self) -> Result<Vec<DetectionPass>, ConsistencyError> {
        Ok(self
            .load(namespace::INCONSISTENCY, HISTORY_ID)
            .await?
            .unwrap_or_default())
    }

    /// Append a terminal recovery attempt
    pub async fn record_attempt(&self, attempt: &RecoveryAttempt) -> Result<(), ConsistencyError> {
        self.save(namespace::RECOVERY, &attempt.id.to_string(), attempt)
            .await
    }

    /// Load persisted recovery attempts
    pub async fn load_attempts(&self) -> Result<Vec<RecoveryAttempt>, ConsistencyError> {
        self.load_all(namespace::RECOVERY).await
    }

    /// Append a terminal transaction record
    pub async fn record_transaction(&self, record: &TransactionRecord) -> Result<(), ConsistencyError> {
        self.save(namespace::TRANSACTION, &record.transaction_id.to_string(), record)
            .await
    }

    /// Load persisted transaction records
    pub async fn load_transactions(&self) -> Result<Vec<TransactionRecord>, ConsistencyError> {
        self.load_all(namespace::TRANSACTION).await
    }

    /// Delete audit records created before `cutoff`
    ///
    /// Record ids are ULIDs, so age is read from the id without loading the record.
    pub async fn prune_audit(&self, cutoff: DateTime<Utc>) -> Result<usize, ConsistencyError> {
        let metadata = self.metadata()?;
        let mut removed = 0;
        for namespace in [namespace::RECOVERY, namespace::TRANSACTION] {
            let entity_type = EntityType::reserved(namespace);
            for id in metadata.list(&entity_type).await? {
                let Ok(ulid) = Ulid::from_string(id.as_str()) else {
                    continue;
                };
                if DateTime::<Utc>::from(ulid.datetime()) < cutoff {
                    metadata.delete(&EntityKey::new(entity_type.clone(), id)).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "pruned expired audit records");
        }
        Ok(removed)
    }
}
