//! Per-principal analytics store adapter
//!
//! Each principal owns a separate instance. A fresh adapter starts
//! unmaterialized; the first write (or [`StoreAdapter::initialize`]) creates it.

use crate::adapter::{Extraction, ProbeReport, StoreAdapter};
use crate::descriptor::{PrincipalId, StoreCapabilities, StoreDescriptor};
use crate::entity::{EntityId, EntityKey, EntityRecord, EntityType};
use crate::error::StoreError;
use crate::memory::MemoryTable;
use async_trait::async_trait;
use std::sync::Arc;

/// Adapter for one principal's analytics instance
#[derive(Debug, Clone)]
pub struct AnalyticsStore {
    descriptor: StoreDescriptor,
    table: Arc<MemoryTable>,
}

impl AnalyticsStore {
    /// Create an unmaterialized instance for `principal`
    #[inline]
    #[must_use]
    pub fn new(principal: PrincipalId, authority_rank: u32) -> Self {
        Self::with_table(principal, authority_rank, Arc::new(MemoryTable::uninitialized()))
    }

    /// Create over an existing table
    #[inline]
    #[must_use]
    pub fn with_table(principal: PrincipalId, authority_rank: u32, table: Arc<MemoryTable>) -> Self {
        Self {
            descriptor: StoreDescriptor::analytics(principal, authority_rank),
            table,
        }
    }

    /// Owning principal
    #[inline]
    #[must_use]
    pub fn principal(&self) -> Option<&PrincipalId> {
        self.descriptor.principal_scope.as_ref()
    }

    /// Backing table
    #[inline]
    #[must_use]
    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }
}

#[async_trait]
impl StoreAdapter for AnalyticsStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::FULL
    }

    async fn probe(&self) -> Result<ProbeReport, StoreError> {
        Ok(self.table.probe())
    }

    async fn read_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StoreError> {
        if !self.table.is_initialized() {
            return Ok(None);
        }
        self.table.read(&self.descriptor.store_id, key)
    }

    async fn write_entity(&self, key: &EntityKey, record: EntityRecord) -> Result<(), StoreError> {
        self.table.write(key, record);
        Ok(())
    }

    async fn delete_entity(&self, key: &EntityKey) -> Result<bool, StoreError> {
        Ok(self.table.delete(key))
    }

    async fn list_entities(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError> {
        Ok(self.table.ids(entity_type))
    }

    async fn extract(&self) -> Result<Extraction, StoreError> {
        Ok(self.table.extract())
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.table.initialize();
        Ok(())
    }

    async fn recreate(&self) -> Result<(), StoreError> {
        tracing::info!(store = %self.descriptor.store_id, "recreating analytics instance");
        self.table.reset();
        Ok(())
    }
}
