//! Durable stage store port, plus an in-memory implementation.
//!
//! The infrastructure layer (pipewright-infra) implements [`StageStore`]
//! with SQLite persistence. [`InMemoryStageStore`] backs the test harness.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pipewright_types::error::StoreError;
use pipewright_types::stage::{StageId, StageRecord};

/// Storage interface for stage records.
///
/// Every write is a compare-and-swap on the record's `version`. The caller
/// sets `record.version` to `expected_version + 1`; an `expected_version`
/// of zero means insert-if-absent.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StageStore: Send + Sync {
    /// Fetch a record, `None` if the identity is unknown.
    fn get(
        &self,
        id: &StageId,
    ) -> impl std::future::Future<Output = Result<Option<StageRecord>, StoreError>> + Send;

    /// Write `record` if the stored version equals `expected_version`.
    ///
    /// Fails with [`StoreError::Conflict`] otherwise.
    fn compare_and_swap(
        &self,
        record: &StageRecord,
        expected_version: u64,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Every record of one workflow tree, root first, then by creation time.
    fn list_tree(
        &self,
        root_id: &StageId,
    ) -> impl std::future::Future<Output = Result<Vec<StageRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryStageStore
// ---------------------------------------------------------------------------

/// Process-local store used by the test harness.
#[derive(Debug, Default)]
pub struct InMemoryStageStore {
    records: DashMap<StageId, StageRecord>,
}

impl InMemoryStageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StageStore for InMemoryStageStore {
    async fn get(&self, id: &StageId) -> Result<Option<StageRecord>, StoreError> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn compare_and_swap(
        &self,
        record: &StageRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let conflict = || StoreError::Conflict {
            stage_id: record.id,
            expected: expected_version,
        };
        if record.version != expected_version + 1 {
            return Err(StoreError::Query(format!(
                "record version {} does not follow expected version {expected_version}",
                record.version
            )));
        }

        match self.records.entry(record.id) {
            Entry::Vacant(slot) if expected_version == 0 => {
                slot.insert(record.clone());
                Ok(())
            }
            Entry::Occupied(mut slot) if expected_version != 0 => {
                if slot.get().version != expected_version {
                    return Err(conflict());
                }
                slot.insert(record.clone());
                Ok(())
            }
            _ => Err(conflict()),
        }
    }

    async fn list_tree(&self, root_id: &StageId) -> Result<Vec<StageRecord>, StoreError> {
        let mut records: Vec<StageRecord> = self
            .records
            .iter()
            .filter(|entry| entry.value().root_id == *root_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|r| (r.parent_id.is_some(), r.created_at, r.id));
        Ok(records)
    }
}
