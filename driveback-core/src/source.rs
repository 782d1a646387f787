use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// Snapshot of one source item as reported by the source connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Unix seconds.
    #[serde(default)]
    pub modified: Option<i64>,
    #[serde(default)]
    pub parent_ids: Vec<String>,
    #[serde(default)]
    pub is_container: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildPage {
    pub items: Vec<ItemMetadata>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Read side of the cloud file store being backed up.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn get_metadata(&self, item_id: &str) -> Result<ItemMetadata, ConnectorError>;

    /// Downloads the item into `dest_dir` and returns the path of the written file.
    async fn download(&self, item_id: &str, dest_dir: &Path) -> Result<PathBuf, ConnectorError>;

    async fn list_children(
        &self,
        container_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, ConnectorError>;
}
