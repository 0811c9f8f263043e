//! The store capability interface
//!
//! Every store role implements [`StoreAdapter`]. The core surface is
//! `probe / read / write / delete`; listing, extraction and recreation back
//! the detector and the recovery strategies. Adapters must be safe for
//! concurrent use by many callers.

use crate::descriptor::{StoreCapabilities, StoreDescriptor};
use crate::entity::{EntityId, EntityKey, EntityRecord, EntityType};
use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Result of a health probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// The store instance exists
    pub initialized: bool,
    /// Internal structure is damaged (not mere absence of data)
    pub structural_failure: bool,
    /// Non-fatal warning
    pub warning: Option<String>,
    /// Number of readable records, when cheap to compute
    pub record_count: Option<u64>,
}

impl ProbeReport {
    /// A healthy, initialized store
    #[inline]
    #[must_use]
    pub fn ok() -> Self {
        Self {
            initialized: true,
            ..Self::default()
        }
    }

    /// With warning
    #[inline]
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// With record count
    #[inline]
    #[must_use]
    pub fn with_record_count(mut self, count: u64) -> Self {
        self.record_count = Some(count);
        self
    }
}

/// Records salvaged from a store instance
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Cleanly decoded records
    pub records: Vec<(EntityKey, EntityRecord)>,
    /// Keys that could not be decoded
    pub skipped: Vec<EntityKey>,
}

/// Capability interface implemented once per store role
#[async_trait]
pub trait StoreAdapter: Send + Sync + Debug {
    /// Static description of this instance
    fn descriptor(&self) -> &StoreDescriptor;

    /// Supported optional operations
    fn capabilities(&self) -> StoreCapabilities;

    /// Check reachability and structural health
    async fn probe(&self) -> Result<ProbeReport, StoreError>;

    /// Read one record; `Ok(None)` when absent
    async fn read_entity(&self, key: &EntityKey) -> Result<Option<EntityRecord>, StoreError>;

    /// Insert or overwrite one record
    async fn write_entity(&self, key: &EntityKey, record: EntityRecord) -> Result<(), StoreError>;

    /// Delete one record; returns whether it existed
    async fn delete_entity(&self, key: &EntityKey) -> Result<bool, StoreError>;

    /// Ids of all records of one type
    async fn list_entities(&self, entity_type: &EntityType) -> Result<Vec<EntityId>, StoreError>;

    /// Salvage every decodable record
    async fn extract(&self) -> Result<Extraction, StoreError> {
        Err(StoreError::unsupported(
            &self.descriptor().store_id,
            "extract",
        ))
    }

    /// Ensure the instance exists without touching existing data
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Drop all data and re-initialize an empty instance
    async fn recreate(&self) -> Result<(), StoreError> {
        Err(StoreError::unsupported(
            &self.descriptor().store_id,
            "recreate",
        ))
    }
}
