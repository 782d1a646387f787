use std::collections::HashMap;

use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::{debug, info};

use super::paths::{PathLayout, sanitize_segment};
use crate::store::{StoreError, unix_now};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderPolicy {
    pub folder_id: String,
    pub folder_name: String,
    pub folder_path: String,
    pub destinations: Vec<String>,
    pub recursive: bool,
    pub enabled: bool,
    pub added_at: i64,
    pub updated_at: i64,
}

/// Persistent folder -> destination policy table.
///
/// The sync engine only ever reads from it, through [`PolicyStore::snapshot`].
#[derive(Clone)]
pub struct PolicyStore {
    pool: SqlitePool,
    layout: PathLayout,
}

impl PolicyStore {
    pub fn new(pool: SqlitePool, layout: PathLayout) -> Self {
        Self { pool, layout }
    }

    pub async fn set_policy(
        &self,
        folder_id: &str,
        folder_name: &str,
        folder_path: &str,
        destinations: &[String],
    ) -> Result<FolderPolicy, StoreError> {
        let now = unix_now();
        let destinations_json = serde_json::to_string(destinations)?;
        let inserted = sqlx::query(
            "INSERT INTO folder_policies (
                folder_id, folder_name, folder_path, destinations, recursive, enabled, added_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 1, 1, ?5, ?5)",
        )
        .bind(folder_id)
        .bind(folder_name)
        .bind(folder_path)
        .bind(&destinations_json)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(StoreError::PolicyExists(folder_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        info!(folder_id, folder_name, ?destinations, "folder policy added");

        self.get_policy(folder_id)
            .await?
            .ok_or_else(|| StoreError::PolicyNotFound(folder_id.to_string()))
    }

    pub async fn update_policy(
        &self,
        folder_id: &str,
        destinations: &[String],
    ) -> Result<(), StoreError> {
        let destinations_json = serde_json::to_string(destinations)?;
        let result = sqlx::query(
            "UPDATE folder_policies SET destinations = ?1, updated_at = ?2 WHERE folder_id = ?3",
        )
        .bind(&destinations_json)
        .bind(unix_now())
        .bind(folder_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PolicyNotFound(folder_id.to_string()));
        }
        info!(folder_id, ?destinations, "folder policy updated");
        Ok(())
    }

    /// Deletes the policy; returns whether one existed.
    pub async fn remove_policy(&self, folder_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM folder_policies WHERE folder_id = ?1")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(folder_id, "folder policy removed");
        }
        Ok(removed)
    }

    pub async fn set_enabled(&self, folder_id: &str, enabled: bool) -> Result<(), StoreError> {
        self.update_flag("enabled", folder_id, enabled).await
    }

    pub async fn set_recursive(&self, folder_id: &str, recursive: bool) -> Result<(), StoreError> {
        self.update_flag("recursive", folder_id, recursive).await
    }

    async fn update_flag(&self, column: &str, folder_id: &str, value: bool) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE folder_policies SET {column} = ?1, updated_at = ?2 WHERE folder_id = ?3"
        );
        let result = sqlx::query(&sql)
            .bind(if value { 1 } else { 0 })
            .bind(unix_now())
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PolicyNotFound(folder_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_policy(&self, folder_id: &str) -> Result<Option<FolderPolicy>, StoreError> {
        let row = sqlx::query(
            "SELECT folder_id, folder_name, folder_path, destinations, recursive, enabled, added_at, updated_at
             FROM folder_policies WHERE folder_id = ?1",
        )
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    pub async fn list_policies(&self) -> Result<Vec<FolderPolicy>, StoreError> {
        let rows = sqlx::query(
            "SELECT folder_id, folder_name, folder_path, destinations, recursive, enabled, added_at, updated_at
             FROM folder_policies ORDER BY folder_name ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(policy_from_row).collect()
    }

    /// Consistent view of all enabled policies for one sync pass.
    pub async fn snapshot(&self) -> Result<PolicySet, StoreError> {
        let rows = sqlx::query(
            "SELECT folder_id, folder_name, folder_path, destinations, recursive, enabled, added_at, updated_at
             FROM folder_policies WHERE enabled = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut policies = Vec::with_capacity(rows.len());
        for row in &rows {
            policies.push(policy_from_row(row)?);
        }
        Ok(PolicySet::new(self.layout.clone(), policies))
    }

    pub async fn resolve_destinations(&self, full_path: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.snapshot().await?.resolve(full_path))
    }
}

fn policy_from_row(row: &SqliteRow) -> Result<FolderPolicy, StoreError> {
    let destinations: String = row.try_get("destinations")?;
    let recursive: i64 = row.try_get("recursive")?;
    let enabled: i64 = row.try_get("enabled")?;
    Ok(FolderPolicy {
        folder_id: row.try_get("folder_id")?,
        folder_name: row.try_get("folder_name")?,
        folder_path: row.try_get("folder_path")?,
        destinations: serde_json::from_str(&destinations)?,
        recursive: recursive != 0,
        enabled: enabled != 0,
        added_at: row.try_get("added_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// In-memory, read-only set of enabled policies keyed by folder name.
#[derive(Debug, Clone)]
pub struct PolicySet {
    layout: PathLayout,
    by_name: HashMap<String, Vec<FolderPolicy>>,
}

impl PolicySet {
    pub fn new(layout: PathLayout, policies: Vec<FolderPolicy>) -> Self {
        let mut by_name: HashMap<String, Vec<FolderPolicy>> = HashMap::new();
        for policy in policies.into_iter().filter(|policy| policy.enabled) {
            by_name
                .entry(sanitize_segment(&policy.folder_name))
                .or_default()
                .push(policy);
        }
        Self { layout, by_name }
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Destinations for the item at `full_path`; the closest ancestor folder
    /// with an applicable policy wins. Empty means the item is not configured.
    ///
    /// Folders are matched by display name, so two folders with the same name
    /// share a policy unless the stored `folder_path` disambiguates them.
    pub fn resolve(&self, full_path: &str) -> Vec<String> {
        let folders = self.layout.ancestor_folders(full_path);
        for depth in (0..folders.len()).rev() {
            let Some(candidates) = self.by_name.get(folders[depth]) else {
                continue;
            };
            let direct_parent = depth + 1 == folders.len();
            let applicable: Vec<&FolderPolicy> = candidates
                .iter()
                .filter(|policy| policy.recursive || direct_parent)
                .collect();
            let Some(first) = applicable.first() else {
                continue;
            };
            let ancestor_path = folders[..=depth].join("/");
            let chosen = applicable
                .iter()
                .find(|policy| self.layout.normalized(&policy.folder_path) == ancestor_path)
                .unwrap_or(first);
            debug!(
                path = full_path,
                folder = chosen.folder_name.as_str(),
                destinations = ?chosen.destinations,
                "policy resolved"
            );
            return chosen.destinations.clone();
        }
        debug!(path = full_path, "no folder policy applies");
        Vec::new()
    }
}
