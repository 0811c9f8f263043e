//! In-memory record table backing the Identity, Metadata and Analytics adapters

use crate::adapter::{Extraction, ProbeReport};
use crate::descriptor::StoreId;
use crate::entity::{EntityId, EntityKey, EntityRecord, EntityType};
use crate::error::StoreError;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Slot {
    Intact(EntityRecord),
    Corrupt(String),
}

#[derive(Debug, Default)]
struct TableState {
    initialized: bool,
    rows: BTreeMap<EntityKey, Slot>,
}

/// Thread-safe ordered record table
///
/// Rows can be marked corrupt to model a damaged instance; corrupt rows fail
/// reads with [`StoreError::Corrupted`] and are skipped by [`MemoryTable::extract`].
#[derive(Debug, Default)]
pub struct MemoryTable {
    state: RwLock<TableState>,
}

impl MemoryTable {
    /// Create an initialized, empty table
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState {
                initialized: true,
                rows: BTreeMap::new(),
            }),
        }
    }

    /// Create a table whose instance does not exist yet
    #[inline]
    #[must_use]
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Whether the instance exists
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Number of rows, corrupt ones included
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    /// Whether the table has no rows
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark a row unreadable
    pub fn corrupt(&self, key: &EntityKey, detail: impl Into<String>) {
        self.state
            .write()
            .rows
            .insert(key.clone(), Slot::Corrupt(detail.into()));
    }

    /// Build a probe report for this table
    #[must_use]
    pub fn probe(&self) -> ProbeReport {
        let state = self.state.read();
        if !state.initialized {
            return ProbeReport::default().with_warning("instance not materialized");
        }
        let corrupt = state
            .rows
            .values()
            .filter(|slot| matches!(slot, Slot::Corrupt(_)))
            .count();
        let mut report = ProbeReport::ok().with_record_count((state.rows.len() - corrupt) as u64);
        if corrupt > 0 {
            report.structural_failure = true;
            report.warning = Some(format!("{corrupt} unreadable rows"));
        }
        report
    }

    /// Read one row
    pub fn read(
        &self,
        store_id: &StoreId,
        key: &EntityKey,
    ) -> Result<Option<EntityRecord>, StoreError> {
        match self.state.read().rows.get(key) {
            None => Ok(None),
            Some(Slot::Intact(record)) => Ok(Some(record.clone())),
            Some(Slot::Corrupt(detail)) => Err(StoreError::Corrupted {
                store_id: store_id.clone(),
                detail: format!("{key}: {detail}"),
            }),
        }
    }

    /// Insert or overwrite one row, materializing the instance if needed
    pub fn write(&self, key: &EntityKey, record: EntityRecord) {
        let mut state = self.state.write();
        state.initialized = true;
        state.rows.insert(key.clone(), Slot::Intact(record));
    }

    /// Delete one row
    pub fn delete(&self, key: &EntityKey) -> bool {
        self.state.write().rows.remove(key).is_some()
    }

    /// Ids of all rows of one type
    #[must_use]
    pub fn ids(&self, entity_type: &EntityType) -> Vec<EntityId> {
        self.state
            .read()
            .rows
            .keys()
            .filter(|key| &key.entity_type == entity_type)
            .map(|key| key.id.clone())
            .collect()
    }

    /// All intact rows
    #[must_use]
    pub fn snapshot(&self) -> Vec<(EntityKey, EntityRecord)> {
        self.extract().records
    }

    /// Split rows into decodable records and skipped keys
    #[must_use]
    pub fn extract(&self) -> Extraction {
        let state = self.state.read();
        let mut extraction = Extraction::default();
        for (key, slot) in &state.rows {
            match slot {
                Slot::Intact(record) => extraction.records.push((key.clone(), record.clone())),
                Slot::Corrupt(_) => extraction.skipped.push(key.clone()),
            }
        }
        extraction
    }

    /// Materialize the instance without touching rows
    pub fn initialize(&self) {
        self.state.write().initialized = true;
    }

    /// Drop every row and leave an empty, initialized instance
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.rows.clear();
        state.initialized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> EntityKey {
        EntityKey::new(EntityType::principal(), id)
    }

    #[test]
    fn write_materializes_uninitialized_table() {
        let table = MemoryTable::uninitialized();
        assert!(!table.is_initialized());

        table.write(&key("p1"), EntityRecord::placeholder());
        assert!(table.is_initialized());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn corrupt_rows_fail_reads_and_flag_probe() {
        let table = MemoryTable::new();
        let store = StoreId::new("metadata");
        table.write(&key("p1"), EntityRecord::placeholder());
        table.corrupt(&key("p2"), "bad page");

        assert!(table.read(&store, &key("p1")).unwrap().is_some());
        assert!(matches!(
            table.read(&store, &key("p2")),
            Err(StoreError::Corrupted { .. })
        ));

        let report = table.probe();
        assert!(report.structural_failure);
        assert_eq!(report.record_count, Some(1));
    }

    #[test]
    fn extract_skips_corrupt_rows() {
        let table = MemoryTable::new();
        table.write(&key("p1"), EntityRecord::placeholder());
        table.corrupt(&key("p2"), "bad page");

        let extraction = table.extract();
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.skipped, vec![key("p2")]);
    }

    #[test]
    fn ids_filter_by_type() {
        let table = MemoryTable::new();
        table.write(&key("p1"), EntityRecord::placeholder());
        table.write(
            &EntityKey::new(EntityType::execution(), "e1"),
            EntityRecord::placeholder(),
        );
        assert_eq!(table.ids(&EntityType::principal()), vec![EntityId::new("p1")]);
    }
}
