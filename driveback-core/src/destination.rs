use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

/// Result of an existence check against one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteProbe {
    pub exists: bool,
    pub size: Option<u64>,
}

impl RemoteProbe {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size: None,
        }
    }

    pub fn found(size: u64) -> Self {
        Self {
            exists: true,
            size: Some(size),
        }
    }

    pub fn matches_size(&self, size: u64) -> bool {
        self.exists && self.size == Some(size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketUsage {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub size: u64,
}

/// Write side of one object-storage target.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    /// Name of the bucket or container this connector writes into.
    fn bucket(&self) -> &str;

    async fn exists(&self, remote_path: &str) -> Result<RemoteProbe, ConnectorError>;

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadReceipt, ConnectorError>;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, ConnectorError>;

    async fn total_size(&self) -> Result<BucketUsage, ConnectorError>;
}
