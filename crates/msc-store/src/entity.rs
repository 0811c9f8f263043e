//! Entity model shared by every store role
//!
//! Writes are keyed by [`EntityKey`], so replaying a write converges to the
//! same stored state.

use crate::descriptor::{PrincipalId, StoreId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of entity types owned by the coordinator itself
pub const RESERVED_PREFIX: &str = "__msc.";

/// Entity class name (`principal`, `execution`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create an entity type
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Platform principals (users / tenants)
    #[inline]
    #[must_use]
    pub fn principal() -> Self {
        Self::new("principal")
    }

    /// Execution runs owned by a principal
    #[inline]
    #[must_use]
    pub fn execution() -> Self {
        Self::new("execution")
    }

    /// Stored artifacts
    #[inline]
    #[must_use]
    pub fn artifact() -> Self {
        Self::new("artifact")
    }

    /// Coordinator-internal type in the reserved namespace
    #[inline]
    #[must_use]
    pub fn reserved(suffix: &str) -> Self {
        Self(format!("{RESERVED_PREFIX}{suffix}"))
    }

    /// Whether this type lives in the reserved namespace
    #[inline]
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(RESERVED_PREFIX)
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entity identifier, unique within its type
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an entity id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Storage key of a record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity class
    pub entity_type: EntityType,
    /// Entity id
    pub id: EntityId,
}

impl EntityKey {
    /// Create a key
    #[inline]
    #[must_use]
    pub fn new(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// An entity id together with the principal whose Analytics store holds it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity id
    pub id: EntityId,
    /// Owning principal, if any
    pub principal: Option<PrincipalId>,
}

impl EntityRef {
    /// A principal entity (its own Analytics scope)
    #[inline]
    #[must_use]
    pub fn principal(id: &str) -> Self {
        Self {
            id: EntityId::new(id),
            principal: Some(PrincipalId::new(id)),
        }
    }

    /// An entity owned by `principal`
    #[inline]
    #[must_use]
    pub fn owned(id: impl Into<EntityId>, principal: PrincipalId) -> Self {
        Self {
            id: id.into(),
            principal: Some(principal),
        }
    }

    /// An entity with no principal scope
    #[inline]
    #[must_use]
    pub fn unscoped(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            principal: None,
        }
    }
}

/// Where a recovered record came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Writer tag, `"recovery"` for repaired data
    pub added_by: String,
    /// Store the data was copied from
    pub recovered_from: Option<StoreId>,
    /// Recovery strategy name
    pub strategy: String,
    /// When the record was recovered
    pub recovered_at: DateTime<Utc>,
}

impl Provenance {
    /// Provenance for a record written by recovery
    #[inline]
    #[must_use]
    pub fn recovery(recovered_from: Option<StoreId>, strategy: impl Into<String>) -> Self {
        Self {
            added_by: "recovery".to_string(),
            recovered_from,
            strategy: strategy.into(),
            recovered_at: Utc::now(),
        }
    }
}

/// Stored representation of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Opaque payload
    pub data: serde_json::Value,
    /// Number of related sub-entities (executions, usage rows, ...)
    pub sub_entity_count: u64,
    /// Set when the record was written by recovery
    pub provenance: Option<Provenance>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    /// Create a record
    #[inline]
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            sub_entity_count: 0,
            provenance: None,
            updated_at: Utc::now(),
        }
    }

    /// Empty record used when a scope is recreated clean
    #[inline]
    #[must_use]
    pub fn placeholder() -> Self {
        Self::new(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// With sub-entity count
    #[inline]
    #[must_use]
    pub fn with_sub_entities(mut self, count: u64) -> Self {
        self.sub_entity_count = count;
        self
    }

    /// With provenance
    #[inline]
    #[must_use]
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Same payload, ignoring provenance and timestamps
    #[inline]
    #[must_use]
    pub fn same_content(&self, other: &EntityRecord) -> bool {
        self.data == other.data && self.sub_entity_count == other.sub_entity_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_namespace_detection() {
        assert!(EntityType::reserved("breaker").is_reserved());
        assert!(!EntityType::principal().is_reserved());
        assert_eq!(EntityType::reserved("breaker").as_str(), "__msc.breaker");
    }

    #[test]
    fn principal_ref_scopes_to_itself() {
        let r = EntityRef::principal("p1");
        assert_eq!(r.principal, Some(PrincipalId::new("p1")));
    }

    #[test]
    fn same_content_ignores_provenance() {
        let a = EntityRecord::new(serde_json::json!({"k": 1})).with_sub_entities(2);
        let b = a
            .clone()
            .with_provenance(Provenance::recovery(Some(StoreId::new("m")), "rebuild"));
        assert!(a.same_content(&b));
        assert!(!a.same_content(&b.clone().with_sub_entities(3)));
    }
}
