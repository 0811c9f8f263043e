//! Identity store adapter
//!
//! The identity directory only holds principal records and cannot be wiped
//! and recreated from the coordinator side.

use crate::adapter::{ProbeReport, StoreAdapter};
use crate::descriptor::{StoreCapabilities, StoreDescriptor, StoreId, StoreRole};
use crate::entity::{EntityId, EntityKey, EntityRecord, EntityType};
use crate::error::StoreError;
use crate::memory::MemoryTable;
use async_trait::async_trait;
use std::sync::Arc;

/// Adapter for the identity directory
#[derive(Debug, Clone)]
pub struct IdentityStore {
    descriptor: StoreDescriptor,
    table: Arc<MemoryTable>,
}

impl IdentityStore {
    /// Create an identity store
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
            descriptor: StoreDescriptor::global(store_id, StoreRole::Identity, authority_rank),
            table,
        }
    }

    /// Backing table
    #[inline]
    #[must_use]
    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }

    fn check_type(&self, key: &EntityKey) -> Result<(), StoreError> {
        if key.entity_type == EntityType::principal() {
            Ok(())
        } else {
            Err(StoreError::unsupported(
                &self.descriptor.store_id,
                "non-principal records",
            ))
        }
    }
}

#[async_trait]
impl StoreAdapter for IdentityStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            incremental_write: true,
            rollback: true,
            recreate: false,
            extract: false,
        }
    }

    async fn probe(&self) -> Result<ProbeReport, StoreError> {
        Ok(self.table.probe())
    }

    async fn read_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StoreError> {
        self.table.read(&self.descriptor.store_id, key)
    }

    async fn write_entity(&self, key: &EntityKey, record: EntityRecord) -> Result<(), StoreError> {
        self.check_type(key)?;
        self.table.write(key, record);
        Ok(())
    }

    async fn delete_entity(&self, key: &EntityKey) -> Result<bool, StoreError> {
        Ok(self.table.delete(key))
    }

    async fn list_entities(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError> {
        Ok(self.table.ids(entity_type))
    }
}
