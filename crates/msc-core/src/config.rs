//! Coordinator configuration
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. Durations are stored as integer seconds or milliseconds.

use crate::error::ConsistencyError;
use msc_breaker::{BreakerConfig, RoleTimeouts};
use msc_store::{EntityType, StoreId, StoreRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub breaker: BreakerSettings,
    pub health: HealthSettings,
    pub scan: ScanSettings,
    pub timeouts: TimeoutSettings,
    pub recovery: RecoverySettings,
    pub audit: AuditSettings,
    /// Entity types to scan; built-ins are used when empty
    pub entity_types: Vec<EntityTypeSpec>,
    pub topology: TopologyConfig,
}

impl ConsistencyConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConsistencyError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConsistencyError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConsistencyError::config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// With breaker settings
    #[inline]
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    /// With recovery settings
    #[inline]
    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoverySettings) -> Self {
        self.recovery = recovery;
        self
    }

    /// With entity type specs
    #[inline]
    #[must_use]
    pub fn with_entity_types(mut self, specs: Vec<EntityTypeSpec>) -> Self {
        self.entity_types = specs;
        self
    }

    /// With topology
    #[inline]
    #[must_use]
    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Reject configurations the coordinator cannot run with
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConsistencyError::config("breaker.failure_threshold must be > 0"));
        }
        if self.breaker.recovery_timeout_secs == 0 {
            return Err(ConsistencyError::config("breaker.recovery_timeout_secs must be > 0"));
        }
        if self.scan.interval_secs == 0 || self.scan.worker_pool == 0 {
            return Err(ConsistencyError::config("scan.interval_secs and scan.worker_pool must be > 0"));
        }
        if self.health.latency_threshold_ms == 0 {
            return Err(ConsistencyError::config("health.latency_threshold_ms must be > 0"));
        }
        self.topology.validate()?;

        let mut names = BTreeSet::new();
        for spec in &self.entity_types {
            if spec.name.is_reserved() {
                return Err(ConsistencyError::config(format!(
                    "entity type {} uses the reserved namespace",
                    spec.name
                )));
            }
            if !names.insert(spec.name.clone()) {
                return Err(ConsistencyError::config(format!(
                    "entity type {} declared twice",
                    spec.name
                )));
            }
            if spec.roles.is_empty() {
                return Err(ConsistencyError::config(format!(
                    "entity type {} has no store roles",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Entity types in force: configured ones, or the built-ins
    #[must_use]
    pub fn entity_specs(&self) -> Vec<EntityTypeSpec> {
        if self.entity_types.is_empty() {
            EntityTypeSpec::builtins()
        } else {
            self.entity_types.clone()
        }
    }

    /// Breaker thresholds
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(self.breaker.failure_threshold)
            .with_recovery_timeout(Duration::from_secs(self.breaker.recovery_timeout_secs))
    }

    /// Per-role call timeouts
    #[must_use]
    pub fn role_timeouts(&self) -> RoleTimeouts {
        RoleTimeouts {
            identity: Duration::from_secs(self.timeouts.identity_secs),
            metadata: Duration::from_secs(self.timeouts.metadata_secs),
            analytics: Duration::from_secs(self.timeouts.analytics_secs),
            artifact: Duration::from_secs(self.timeouts.artifact_secs),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

/// Health classification thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Probes slower than this report Degraded
    pub latency_threshold_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            latency_threshold_ms: 500,
        }
    }
}

impl HealthSettings {
    /// Latency threshold as a duration
    #[inline]
    #[must_use]
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }
}

/// Background scan loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub interval_secs: u64,
    /// Maximum concurrent probes, entity scans and recoveries
    pub worker_pool: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            worker_pool: 8,
        }
    }
}

impl ScanSettings {
    /// Scan interval as a duration
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Per-role adapter call timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub identity_secs: u64,
    pub metadata_secs: u64,
    pub analytics_secs: u64,
    pub artifact_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            identity_secs: 10,
            metadata_secs: 10,
            analytics_secs: 10,
            artifact_secs: 30,
        }
    }
}

/// Recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Plan and execute recovery after every detection pass
    pub auto_recover: bool,
    /// Automatic retries of a partially successful attempt
    pub partial_retry_limit: u32,
    /// Backups older than this are not considered
    pub backup_max_age_secs: u64,
    /// Backups younger than this restore without data loss
    pub lossless_backup_window_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            auto_recover: true,
            partial_retry_limit: 1,
            backup_max_age_secs: 86_400,
            lossless_backup_window_secs: 300,
        }
    }
}

impl RecoverySettings {
    /// With auto recovery
    #[inline]
    #[must_use]
    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }
}

/// Audit retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub retention_days: u32,
    /// Detection passes kept in the inconsistency history
    pub inconsistency_history: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            retention_days: 90,
            inconsistency_history: 32,
        }
    }
}

impl AuditSettings {
    /// Retention window
    #[inline]
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// How an entity maps to the principal owning its analytics copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "field")]
pub enum Ownership {
    /// The entity id is the principal id
    SelfPrincipal,
    /// A string field of the record data names the principal
    Field(String),
    /// No principal-scoped copy exists
    Unscoped,
}

/// Which roles may seed a missing copy in `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildRule {
    pub target: StoreRole,
    pub sources: Vec<StoreRole>,
}

/// Entity type description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeSpec {
    pub name: EntityType,
    /// Store roles expected to hold a copy
    pub roles: Vec<StoreRole>,
    /// Roles whose `sub_entity_count` is meaningful for this type
    #[serde(default)]
    pub counted_roles: Vec<StoreRole>,
    #[serde(default)]
    pub rebuild_sources: Vec<RebuildRule>,
    /// Allowed sub-entity count difference
    #[serde(default)]
    pub sub_entity_tolerance: u64,
    #[serde(default = "default_ownership")]
    pub owner: Ownership,
}

fn default_ownership() -> Ownership {
    Ownership::Unscoped
}

impl EntityTypeSpec {
    /// Create a spec with no rebuild rules
    #[must_use]
    pub fn new(name: EntityType, roles: Vec<StoreRole>) -> Self {
        Self {
            name,
            roles,
            counted_roles: Vec::new(),
            rebuild_sources: Vec::new(),
            sub_entity_tolerance: 0,
            owner: Ownership::Unscoped,
        }
    }

    /// With counted roles
    #[inline]
    #[must_use]
    pub fn with_counted_roles(mut self, roles: Vec<StoreRole>) -> Self {
        self.counted_roles = roles;
        self
    }

    /// With a rebuild rule
    #[inline]
    #[must_use]
    pub fn with_rebuild(mut self, target: StoreRole, sources: Vec<StoreRole>) -> Self {
        self.rebuild_sources.retain(|rule| rule.target != target);
        self.rebuild_sources.push(RebuildRule { target, sources });
        self
    }

    /// With sub-entity tolerance
    #[inline]
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: u64) -> Self {
        self.sub_entity_tolerance = tolerance;
        self
    }

    /// With ownership
    #[inline]
    #[must_use]
    pub fn with_owner(mut self, owner: Ownership) -> Self {
        self.owner = owner;
        self
    }

    /// Roles allowed to seed `target`
    #[must_use]
    pub fn sources_for(&self, target: StoreRole) -> &[StoreRole] {
        self.rebuild_sources
            .iter()
            .find(|rule| rule.target == target)
            .map(|rule| rule.sources.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `role` is expected to hold a copy
    #[inline]
    #[must_use]
    pub fn covers(&self, role: StoreRole) -> bool {
        self.roles.contains(&role)
    }

    /// Whether counts reported by `role` are compared
    #[inline]
    #[must_use]
    pub fn counts(&self, role: StoreRole) -> bool {
        self.counted_roles.contains(&role)
    }

    /// Built-in `principal`, `execution` and `artifact` types
    #[must_use]
    pub fn builtins() -> Vec<Self> {
        use StoreRole::{Analytics, Artifact, Identity, Metadata};
        vec![
            Self::new(EntityType::principal(), vec![Identity, Metadata, Analytics])
                .with_counted_roles(vec![Metadata, Analytics])
                .with_rebuild(Analytics, vec![Metadata])
                .with_rebuild(Metadata, vec![Identity])
                .with_owner(Ownership::SelfPrincipal),
            Self::new(EntityType::execution(), vec![Metadata, Analytics])
                .with_counted_roles(vec![Metadata, Analytics])
                .with_rebuild(Analytics, vec![Metadata])
                .with_rebuild(Metadata, vec![Analytics])
                .with_owner(Ownership::Field("principal".to_string())),
            Self::new(EntityType::artifact(), vec![Metadata, Artifact])
                .with_rebuild(Metadata, vec![Artifact])
                .with_rebuild(Artifact, vec![Metadata]),
        ]
    }
}

/// One global store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub id: StoreId,
    pub role: StoreRole,
    pub rank: u32,
    /// Root directory for file-based stores
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Create a store entry
    #[must_use]
    pub fn new(id: impl Into<StoreId>, role: StoreRole, rank: u32) -> Self {
        Self {
            id: id.into(),
            role,
            rank,
            path: None,
        }
    }

    /// With path
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Store topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub stores: Vec<StoreConfig>,
    /// Authority rank of per-principal analytics stores; none disables them
    pub analytics_rank: Option<u32>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            stores: vec![
                StoreConfig::new("identity", StoreRole::Identity, 0),
                StoreConfig::new("metadata", StoreRole::Metadata, 1),
                StoreConfig::new("artifact", StoreRole::Artifact, 3).with_path("artifacts"),
            ],
            analytics_rank: Some(2),
        }
    }
}

impl TopologyConfig {
    /// Reject empty topologies and ambiguous precedence
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        if self.stores.is_empty() && self.analytics_rank.is_none() {
            return Err(ConsistencyError::config("topology has no stores"));
        }
        let mut ids = BTreeSet::new();
        let mut ranks: BTreeMap<u32, String> = BTreeMap::new();
        if let Some(rank) = self.analytics_rank {
            ranks.insert(rank, "analytics".to_string());
        }
        for store in &self.stores {
            if store.role.is_principal_scoped() {
                return Err(ConsistencyError::config(format!(
                    "store {} is principal-scoped; use topology.analytics_rank",
                    store.id
                )));
            }
            if !ids.insert(store.id.clone()) {
                return Err(ConsistencyError::config(format!(
                    "duplicate store id {}",
                    store.id
                )));
            }
            if let Some(other) = ranks.insert(store.rank, store.id.to_string()) {
                return Err(ConsistencyError::config(format!(
                    "authority rank {} shared by {other} and {}",
                    store.rank, store.id
                )));
            }
            if store.role == StoreRole::Artifact && store.path.is_none() {
                return Err(ConsistencyError::config(format!(
                    "artifact store {} needs a path",
                    store.id
                )));
            }
        }
        Ok(())
    }
}
