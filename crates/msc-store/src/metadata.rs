//! Metadata store adapter
//!
//! General-purpose record store. Also hosts the coordinator's reserved
//! `__msc.*` namespace.

use crate::adapter::{Extraction, ProbeReport, StoreAdapter};
use crate::descriptor::{StoreCapabilities, StoreDescriptor, StoreId, StoreRole};
use crate::entity::{EntityId, EntityKey, EntityRecord, EntityType};
use crate::error::StoreError;
use crate::memory::MemoryTable;
use async_trait::async_trait;
use std::sync::Arc;

/// Adapter for the platform metadata store
#[derive(Debug, Clone)]
pub struct MetadataStore {
    descriptor: StoreDescriptor,
    table: Arc<MemoryTable>,
}

impl MetadataStore {
    /// Create a metadata store
    #[inline]
    #[must_use]
    pub fn new(store_id: impl Into<StoreId>, authority_rank: u32) -> Self {
        Self::with_table(store_id, authority_rank, Arc::new(MemoryTable::new()))
    }

    /// Create over an existing table
    #[inline]
    #[must_use]
    pub fn with_table(
        store_id: impl Into<StoreId>,
        authority_rank: u32,
        table: Arc<MemoryTable>,
    ) -> Self {
        Self {
            descriptor: StoreDescriptor::global(store_id, StoreRole::Metadata, authority_rank),
            table,
        }
    }

    /// Backing table
    #[inline]
    #[must_use]
    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }
}

#[async_trait]
impl StoreAdapter for MetadataStore {
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
        tracing::warn!(store = %self.descriptor.store_id, "recreating metadata store");
        self.table.reset();
        Ok(())
    }
}
