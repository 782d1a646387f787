use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::store::{StoreError, unix_now};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedRoot {
    pub item_id: String,
    pub item_name: String,
    pub is_container: bool,
    pub added_at: i64,
}

/// Roots read once per daemon pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSelection {
    pub items: Vec<String>,
    pub containers: Vec<String>,
}

impl SyncSelection {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.containers.is_empty()
    }
}

#[derive(Clone)]
pub struct SelectionStore {
    pool: SqlitePool,
}

impl SelectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns false when the item was already selected.
    pub async fn add(
        &self,
        item_id: &str,
        item_name: &str,
        is_container: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sync_selection (item_id, item_name, is_container, added_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(item_id) DO NOTHING",
        )
        .bind(item_id)
        .bind(item_name)
        .bind(if is_container { 1 } else { 0 })
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove(&self, item_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_selection WHERE item_id = ?1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self) -> Result<Vec<SelectedRoot>, StoreError> {
        let rows = sqlx::query(
            "SELECT item_id, item_name, is_container, added_at FROM sync_selection ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let is_container: i64 = row.try_get("is_container")?;
            out.push(SelectedRoot {
                item_id: row.try_get("item_id")?,
                item_name: row.try_get("item_name")?,
                is_container: is_container != 0,
                added_at: row.try_get("added_at")?,
            });
        }
        Ok(out)
    }

    pub async fn clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sync_selection")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn snapshot(&self) -> Result<SyncSelection, StoreError> {
        let mut selection = SyncSelection::default();
        for root in self.list().await? {
            if root.is_container {
                selection.containers.push(root.item_id);
            } else {
                selection.items.push(root.item_id);
            }
        }
        Ok(selection)
    }
}
