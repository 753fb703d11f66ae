use thiserror::Error;

use crate::stage::StageId;

/// Errors from a durable stage store.
///
/// `get` reports a missing record as `Ok(None)`; only the compare-and-swap
/// path produces [`StoreError::Conflict`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("version conflict on stage {stage_id}: expected version {expected}")]
    Conflict { stage_id: StageId, expected: u64 },

    #[error("corrupt stage record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
