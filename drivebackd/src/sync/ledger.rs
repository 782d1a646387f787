use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::{debug, info};

use super::paths::PathLayout;
use crate::store::{StoreError, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Synced,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Synced => "synced",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(TransferStatus::Pending),
            "synced" => Ok(TransferStatus::Synced),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

/// Optional attributes written alongside a status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferUpdate {
    pub item_name: Option<String>,
    pub remote_path: Option<String>,
    pub size: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub item_id: String,
    pub destination: String,
    pub item_name: Option<String>,
    pub status: TransferStatus,
    pub last_attempt_at: i64,
    pub remote_path: Option<String>,
    pub size: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderStat {
    pub folder: String,
    pub destination: String,
    pub total: u64,
    pub synced: u64,
    pub pending: u64,
    pub failed: u64,
    pub percent_synced: f64,
}

/// Durable per-(item, destination) outcome of the last completed attempt.
#[derive(Clone)]
pub struct TransferLedger {
    pool: SqlitePool,
}

const RECORD_COLUMNS: &str = "item_id, destination, item_name, status, last_attempt_at, remote_path, size, error_message";

impl TransferLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record_status(
        &self,
        item_id: &str,
        destination: &str,
        status: TransferStatus,
        update: TransferUpdate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO transfer_records (
                item_id, destination, item_name, status, last_attempt_at, remote_path, size, error_message
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(item_id, destination) DO UPDATE SET
                item_name = COALESCE(excluded.item_name, transfer_records.item_name),
                status = excluded.status,
                last_attempt_at = excluded.last_attempt_at,
                remote_path = excluded.remote_path,
                size = excluded.size,
                error_message = excluded.error_message",
        )
        .bind(item_id)
        .bind(destination)
        .bind(update.item_name.as_deref())
        .bind(status.as_str())
        .bind(unix_now())
        .bind(update.remote_path.as_deref())
        .bind(update.size.map(|size| size as i64))
        .bind(update.error.as_deref())
        .execute(&self.pool)
        .await?;
        debug!(item_id, destination, status = status.as_str(), "ledger updated");
        Ok(())
    }

    pub async fn get_record(
        &self,
        item_id: &str,
        destination: &str,
    ) -> Result<Option<TransferRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM transfer_records WHERE item_id = ?1 AND destination = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(item_id)
            .bind(destination)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn destinations_for(
        &self,
        item_id: &str,
    ) -> Result<BTreeMap<String, TransferRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM transfer_records WHERE item_id = ?1");
        let rows = sqlx::query(&sql)
            .bind(item_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in &rows {
            let record = record_from_row(row)?;
            out.insert(record.destination.clone(), record);
        }
        Ok(out)
    }

    pub async fn list_by_status(
        &self,
        status: TransferStatus,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM transfer_records WHERE status = ?1
             ORDER BY last_attempt_at DESC, item_id ASC, destination ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Distinct item ids with at least one pending record.
    pub async fn pending_items(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT item_id FROM transfer_records WHERE status = 'pending' ORDER BY item_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("item_id").map_err(StoreError::from))
            .collect()
    }

    /// `failed -> pending` for one pair. Returns false when the pair is absent
    /// or not failed.
    pub async fn mark_pending_for_retry(
        &self,
        item_id: &str,
        destination: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE transfer_records SET status = 'pending', error_message = NULL
             WHERE item_id = ?1 AND destination = ?2 AND status = 'failed'",
        )
        .bind(item_id)
        .bind(destination)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_all_failed_pending(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE transfer_records SET status = 'pending', error_message = NULL WHERE status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        info!(count, "failed transfers marked for retry");
        Ok(count)
    }

    /// `pending -> failed` for every pair of `item_id` still pending, so a
    /// retry that could not reach a destination stays queryable as failed.
    pub async fn fail_pending(&self, item_id: &str, error: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE transfer_records SET status = 'failed', error_message = ?1, last_attempt_at = ?2
             WHERE item_id = ?3 AND status = 'pending'",
        )
        .bind(error)
        .bind(unix_now())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_item(&self, item_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM transfer_records WHERE item_id = ?1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM transfer_records GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            let total = total.max(0) as u64;
            match TransferStatus::parse(&status)? {
                TransferStatus::Pending => counts.pending = total,
                TransferStatus::Synced => counts.synced = total,
                TransferStatus::Failed => counts.failed = total,
            }
        }
        Ok(counts)
    }

    /// Per top-level folder and destination progress. Records without a
    /// remote path or stored at the root are not attributed to any folder.
    pub async fn folder_stats(&self, layout: &PathLayout) -> Result<Vec<FolderStat>, StoreError> {
        let rows = sqlx::query(
            "SELECT destination, status, remote_path FROM transfer_records WHERE remote_path IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<(String, String), StatusCounts> = BTreeMap::new();
        for row in &rows {
            let remote_path: String = row.try_get("remote_path")?;
            let Some(folder) = layout.top_level_folder(&remote_path) else {
                continue;
            };
            let destination: String = row.try_get("destination")?;
            let status: String = row.try_get("status")?;
            let counts = grouped.entry((folder.to_string(), destination)).or_default();
            match TransferStatus::parse(&status)? {
                TransferStatus::Pending => counts.pending += 1,
                TransferStatus::Synced => counts.synced += 1,
                TransferStatus::Failed => counts.failed += 1,
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((folder, destination), counts)| {
                let total = counts.pending + counts.synced + counts.failed;
                let percent_synced = if total == 0 {
                    0.0
                } else {
                    counts.synced as f64 * 100.0 / total as f64
                };
                FolderStat {
                    folder,
                    destination,
                    total,
                    synced: counts.synced,
                    pending: counts.pending,
                    failed: counts.failed,
                    percent_synced,
                }
            })
            .collect())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<TransferRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let size: Option<i64> = row.try_get("size")?;
    Ok(TransferRecord {
        item_id: row.try_get("item_id")?,
        destination: row.try_get("destination")?,
        item_name: row.try_get("item_name")?,
        status: TransferStatus::parse(&status)?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        remote_path: row.try_get("remote_path")?,
        size: size.map(|size| size.max(0) as u64),
        error_message: row.try_get("error_message")?,
    })
}
