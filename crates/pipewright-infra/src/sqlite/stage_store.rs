//! SQLite implementation of the `StageStore` port.
//!
//! Each stage is one row. The full record is a JSON blob; `version` is a
//! real column so the compare-and-swap can be expressed as a conditional
//! `UPDATE`. An expected version of zero is an insert that must not
//! replace an existing row.

use chrono::{DateTime, SecondsFormat, Utc};
use pipewright_core::store::StageStore;
use pipewright_types::error::StoreError;
use pipewright_types::stage::{StageId, StageRecord};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of [`StageStore`].
#[derive(Clone)]
pub struct SqliteStageStore {
    pool: DatabasePool,
}

impl SqliteStageStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Root stages, newest first.
    pub async fn list_roots(&self, limit: u32) -> Result<Vec<StageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM stages WHERE parent_id IS NULL ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(decode_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fixed-width timestamps so `ORDER BY created_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::error!(error = %err, "stage store connection failure");
            StoreError::Connection
        }
        other => StoreError::Query(other.to_string()),
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<StageRecord, StoreError> {
    let json: String = row.try_get("record").map_err(query_error)?;
    serde_json::from_str(&json).map_err(|e| StoreError::Corrupt(e.to_string()))
}

// ---------------------------------------------------------------------------
// StageStore impl
// ---------------------------------------------------------------------------

impl StageStore for SqliteStageStore {
    async fn get(&self, id: &StageId) -> Result<Option<StageRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM stages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn compare_and_swap(
        &self,
        record: &StageRecord,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        if record.version != expected_version + 1 {
            return Err(StoreError::Query(format!(
                "record version {} does not follow expected version {expected_version}",
                record.version
            )));
        }
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::Query(format!("serialize stage record: {e}")))?;
        let version = i64::try_from(record.version)
            .map_err(|_| StoreError::Query(format!("version {} out of range", record.version)))?;

        let result = if expected_version == 0 {
            sqlx::query(
                r#"INSERT INTO stages (id, root_id, parent_id, kind, state, version, record, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(id) DO NOTHING"#,
            )
            .bind(record.id.to_string())
            .bind(record.root_id.to_string())
            .bind(record.parent_id.map(|p| p.to_string()))
            .bind(&record.kind)
            .bind(record.state.as_str())
            .bind(version)
            .bind(&json)
            .bind(format_datetime(&record.created_at))
            .bind(format_datetime(&record.updated_at))
            .execute(&self.pool.writer)
            .await
        } else {
            sqlx::query(
                r#"UPDATE stages
                   SET state = ?, version = ?, record = ?, updated_at = ?
                   WHERE id = ? AND version = ?"#,
            )
            .bind(record.state.as_str())
            .bind(version)
            .bind(&json)
            .bind(format_datetime(&record.updated_at))
            .bind(record.id.to_string())
            .bind(version - 1)
            .execute(&self.pool.writer)
            .await
        }
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                stage_id: record.id,
                expected: expected_version,
            });
        }
        Ok(())
    }

    async fn list_tree(&self, root_id: &StageId) -> Result<Vec<StageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM stages WHERE root_id = ? ORDER BY parent_id IS NOT NULL, created_at, id",
        )
        .bind(root_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(decode_row).collect()
    }
}
