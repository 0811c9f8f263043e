//! Store identity, roles and authority precedence

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// Stable, unique store identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Create a store id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the Analytics instance scoped to `principal`
    #[inline]
    #[must_use]
    pub fn analytics_for(principal: &PrincipalId) -> Self {
        Self(format!("analytics:{principal}"))
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StoreId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Principal (user / tenant) identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Create a principal id
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

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Functional category of a persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    /// Identity provider directory
    Identity,
    /// Platform metadata store
    Metadata,
    /// Per-principal analytics store
    Analytics,
    /// File-based artifact store
    Artifact,
}

impl StoreRole {
    /// All roles, in conventional authority order
    pub const ALL: [StoreRole; 4] = [
        StoreRole::Identity,
        StoreRole::Metadata,
        StoreRole::Analytics,
        StoreRole::Artifact,
    ];

    /// Whether instances of this role are created per principal
    #[inline]
    #[must_use]
    pub fn is_principal_scoped(self) -> bool {
        matches!(self, StoreRole::Analytics)
    }

    /// Default per-call timeout for this role
    #[inline]
    #[must_use]
    pub fn default_timeout(self) -> Duration {
        match self {
            StoreRole::Artifact => Duration::from_secs(30),
            StoreRole::Identity | StoreRole::Metadata | StoreRole::Analytics => {
                Duration::from_secs(10)
            }
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreRole::Identity => "identity",
            StoreRole::Metadata => "metadata",
            StoreRole::Analytics => "analytics",
            StoreRole::Artifact => "artifact",
        };
        f.write_str(name)
    }
}

/// What an adapter can do beyond read/write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// Individual records can be written without rewriting the store
    pub incremental_write: bool,
    /// A completed write can be undone by delete/restore
    pub rollback: bool,
    /// The store can be re-initialized empty
    pub recreate: bool,
    /// Records can be extracted one by one from a damaged instance
    pub extract: bool,
}

impl StoreCapabilities {
    /// Everything supported
    pub const FULL: StoreCapabilities = StoreCapabilities {
        incremental_write: true,
        rollback: true,
        recreate: true,
        extract: true,
    };
}

/// Static description of one store instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    /// Unique, stable id
    pub store_id: StoreId,
    /// Functional role
    pub role: StoreRole,
    /// Owning principal for per-principal stores
    pub principal_scope: Option<PrincipalId>,
    /// Lower is more authoritative
    pub authority_rank: u32,
}

impl StoreDescriptor {
    /// Describe a global store
    #[inline]
    #[must_use]
    pub fn global(store_id: impl Into<StoreId>, role: StoreRole, authority_rank: u32) -> Self {
        Self {
            store_id: store_id.into(),
            role,
            principal_scope: None,
            authority_rank,
        }
    }

    /// Describe the Analytics instance of one principal
    #[inline]
    #[must_use]
    pub fn analytics(principal: PrincipalId, authority_rank: u32) -> Self {
        Self {
            store_id: StoreId::analytics_for(&principal),
            role: StoreRole::Analytics,
            principal_scope: Some(principal),
            authority_rank,
        }
    }

    /// Whether this is a global (not principal-scoped) store
    #[inline]
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.principal_scope.is_none()
    }

    /// Total authority order: rank first, store id breaks ties
    #[inline]
    #[must_use]
    pub fn precedence(&self, other: &StoreDescriptor) -> Ordering {
        self.authority_rank
            .cmp(&other.authority_rank)
            .then_with(|| self.store_id.cmp(&other.store_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analytics_descriptor_is_principal_scoped() {
        let desc = StoreDescriptor::analytics(PrincipalId::new("p1"), 2);
        assert_eq!(desc.store_id.as_str(), "analytics:p1");
        assert_eq!(desc.role, StoreRole::Analytics);
        assert!(!desc.is_global());
    }

    #[test]
    fn precedence_breaks_rank_ties_by_id() {
        let a = StoreDescriptor::global("a", StoreRole::Metadata, 1);
        let b = StoreDescriptor::global("b", StoreRole::Metadata, 1);
        let identity = StoreDescriptor::global("z", StoreRole::Identity, 0);

        assert_eq!(a.precedence(&b), Ordering::Less);
        assert_eq!(identity.precedence(&a), Ordering::Less);
    }

    #[test]
    fn artifact_calls_get_longer_timeout() {
        assert_eq!(StoreRole::Artifact.default_timeout(), Duration::from_secs(30));
        assert_eq!(StoreRole::Metadata.default_timeout(), Duration::from_secs(10));
    }
}
