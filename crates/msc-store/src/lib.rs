//! MSC Store - persistence roles and their adapters
//!
//! Defines the vocabulary shared by every other MSC crate:
//! - Store identity, roles and authority precedence ([`StoreDescriptor`])
//! - The entity model (keys, records, recovery provenance)
//! - The fixed [`StoreAdapter`] capability interface
//! - One concrete adapter per store role
//!
//! # Example
//!
//! ```rust,ignore
//! use msc_store::{EntityKey, EntityRecord, EntityType, MetadataStore, StoreAdapter};
//!
//! # async fn example() -> Result<(), msc_store::StoreError> {
//! let store = MetadataStore::new("metadata", 1);
//! let key = EntityKey::new(EntityType::principal(), "p1");
//! store.write_entity(&key, EntityRecord::new(serde_json::json!({"name": "p1"}))).await?;
//! assert!(store.read_entity(&key).await?.is_some());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod adapter;
pub mod analytics;
pub mod artifact;
pub mod descriptor;
pub mod entity;
pub mod error;
pub mod identity;
pub mod memory;
pub mod metadata;

pub use adapter::{Extraction, ProbeReport, StoreAdapter};
pub use analytics::AnalyticsStore;
pub use artifact::ArtifactStore;
pub use descriptor::{PrincipalId, StoreCapabilities, StoreDescriptor, StoreId, StoreRole};
pub use entity::{EntityId, EntityKey, EntityRecord, EntityRef, EntityType, Provenance};
pub use error::StoreError;
pub use identity::IdentityStore;
pub use memory::MemoryTable;
pub use metadata::MetadataStore;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
