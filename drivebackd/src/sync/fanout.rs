use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use driveback_core::{
    BucketUsage, ConnectorError, DestinationConnector, LocalDirDestination, RemoteEntry,
    RemoteProbe, UploadReceipt,
};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::transfer::{TransferError, TransferGate};

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination {0} is not available")]
    Unavailable(String),
    #[error("destination {key} is misconfigured: {reason}")]
    Misconfigured { key: String, reason: String },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl DestinationError {
    /// Connector error behind this failure, if any.
    pub fn connector_error(&self) -> Option<&ConnectorError> {
        match self {
            DestinationError::Connector(err)
            | DestinationError::Transfer(TransferError::Connector(err)) => Some(err),
            _ => None,
        }
    }
}

/// Configuration of one destination as read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSettings {
    pub key: String,
    pub enabled: bool,
    pub bucket: Option<String>,
    pub root: Option<PathBuf>,
}

#[derive(Clone)]
pub struct DestinationHandle {
    key: String,
    bucket: String,
    connector: Arc<dyn DestinationConnector>,
}

impl DestinationHandle {
    pub fn new(key: impl Into<String>, connector: Arc<dyn DestinationConnector>) -> Self {
        Self {
            key: key.into(),
            bucket: connector.bucket().to_string(),
            connector,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationInfo {
    pub key: String,
    pub available: bool,
    pub bucket: Option<String>,
    pub usage: Option<BucketUsage>,
    pub error: Option<String>,
}

pub type UploadResult = Result<UploadReceipt, DestinationError>;

/// Per-destination outcome of one fan-out upload.
#[derive(Debug)]
pub struct FanoutResult {
    pub remote_path: String,
    pub destinations: BTreeMap<String, UploadResult>,
}

impl FanoutResult {
    /// At least one destination accepted the file.
    pub fn success(&self) -> bool {
        self.destinations.values().any(Result::is_ok)
    }

    pub fn all_success(&self) -> bool {
        self.destinations.values().all(Result::is_ok)
    }
}

/// Owns one connector per successfully configured destination.
#[derive(Clone)]
pub struct DestinationManager {
    handles: Vec<DestinationHandle>,
    excluded: Vec<(String, String)>,
    gate: TransferGate,
}

impl DestinationManager {
    pub fn new(gate: TransferGate) -> Self {
        Self {
            handles: Vec::new(),
            excluded: Vec::new(),
            gate,
        }
    }

    /// Builds filesystem-backed destinations. Misconfigured entries are
    /// logged once and left out; they never fail construction.
    pub fn from_settings(settings: &[DestinationSettings], gate: TransferGate) -> Self {
        let mut manager = Self::new(gate);
        for entry in settings {
            if !entry.enabled {
                debug!(destination = entry.key.as_str(), "destination disabled");
                continue;
            }
            match validate(entry) {
                Ok((bucket, root)) => {
                    info!(
                        destination = entry.key.as_str(),
                        bucket = bucket.as_str(),
                        root = %root.display(),
                        "destination initialized"
                    );
                    manager.register(DestinationHandle::new(
                        entry.key.clone(),
                        Arc::new(LocalDirDestination::new(root, bucket)),
                    ));
                }
                Err(err) => {
                    warn!(destination = entry.key.as_str(), error = %err, "destination excluded");
                    if let DestinationError::Misconfigured { key, reason } = err {
                        manager.excluded.push((key, reason));
                    }
                }
            }
        }
        manager
    }

    pub fn with_handles(handles: Vec<DestinationHandle>, gate: TransferGate) -> Self {
        let mut manager = Self::new(gate);
        for handle in handles {
            manager.register(handle);
        }
        manager
    }

    pub fn register(&mut self, handle: DestinationHandle) {
        self.handles.retain(|existing| existing.key != handle.key);
        self.handles.push(handle);
    }

    pub fn gate(&self) -> &TransferGate {
        &self.gate
    }

    pub fn available_destinations(&self) -> Vec<String> {
        self.handles.iter().map(|handle| handle.key.clone()).collect()
    }

    pub fn is_available(&self, key: &str) -> bool {
        self.handle(key).is_some()
    }

    fn handle(&self, key: &str) -> Option<&DestinationHandle> {
        self.handles.iter().find(|handle| handle.key == key)
    }

    /// Existence probe. Unknown destinations and probe errors read as missing.
    pub async fn exists(&self, remote_path: &str, key: &str) -> RemoteProbe {
        let Some(handle) = self.handle(key) else {
            warn!(destination = key, "destination not available");
            return RemoteProbe::missing();
        };
        match handle.connector.exists(remote_path).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(destination = key, remote_path, error = %err, "existence check failed");
                RemoteProbe::missing()
            }
        }
    }

    /// Uploads to every named destination concurrently and yields each
    /// outcome as soon as that destination finishes.
    pub fn upload_stream<'a>(
        &'a self,
        local_path: &'a Path,
        remote_path: &'a str,
        destinations: &[String],
    ) -> FuturesUnordered<BoxFuture<'a, (String, UploadResult)>> {
        let pending = FuturesUnordered::new();
        let mut seen = HashSet::new();
        for key in destinations {
            if !seen.insert(key.as_str()) {
                continue;
            }
            let key = key.clone();
            pending.push(
                async move {
                    let result = self.upload_one(&key, local_path, remote_path).await;
                    (key, result)
                }
                .boxed(),
            );
        }
        pending
    }

    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        destinations: &[String],
    ) -> FanoutResult {
        let mut stream = self.upload_stream(local_path, remote_path, destinations);
        let mut results = BTreeMap::new();
        while let Some((key, result)) = stream.next().await {
            results.insert(key, result);
        }
        FanoutResult {
            remote_path: remote_path.to_string(),
            destinations: results,
        }
    }

    async fn upload_one(&self, key: &str, local_path: &Path, remote_path: &str) -> UploadResult {
        let Some(handle) = self.handle(key) else {
            warn!(destination = key, "destination not available, skipping");
            return Err(DestinationError::Unavailable(key.to_string()));
        };
        match self
            .gate
            .upload(handle.connector.as_ref(), local_path, remote_path)
            .await
        {
            Ok(receipt) => {
                info!(destination = key, remote_path, size = receipt.size, "uploaded");
                Ok(receipt)
            }
            Err(err) => {
                error!(destination = key, remote_path, error = %err, "upload failed");
                Err(err.into())
            }
        }
    }

    pub async fn list_files(
        &self,
        remote_path: &str,
        key: &str,
    ) -> Result<Vec<RemoteEntry>, DestinationError> {
        let handle = self
            .handle(key)
            .ok_or_else(|| DestinationError::Unavailable(key.to_string()))?;
        Ok(handle.connector.list(remote_path).await?)
    }

    pub async fn bucket_size(&self, key: &str) -> Result<BucketUsage, DestinationError> {
        let handle = self
            .handle(key)
            .ok_or_else(|| DestinationError::Unavailable(key.to_string()))?;
        Ok(handle.connector.total_size().await?)
    }

    /// Bucket and usage for every destination, including excluded ones with
    /// the reason they were left out.
    pub async fn destination_info(&self) -> Vec<DestinationInfo> {
        let mut out = Vec::with_capacity(self.handles.len() + self.excluded.len());
        for handle in &self.handles {
            let (usage, error) = match handle.connector.total_size().await {
                Ok(usage) => (Some(usage), None),
                Err(err) => (None, Some(err.to_string())),
            };
            out.push(DestinationInfo {
                key: handle.key.clone(),
                available: true,
                bucket: Some(handle.bucket.clone()),
                usage,
                error,
            });
        }
        for (key, reason) in &self.excluded {
            out.push(DestinationInfo {
                key: key.clone(),
                available: false,
                bucket: None,
                usage: None,
                error: Some(reason.clone()),
            });
        }
        out
    }
}

fn validate(entry: &DestinationSettings) -> Result<(String, PathBuf), DestinationError> {
    let misconfigured = |reason: &str| DestinationError::Misconfigured {
        key: entry.key.clone(),
        reason: reason.to_string(),
    };
    let bucket = entry
        .bucket
        .as_deref()
        .map(str::trim)
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| misconfigured("bucket is not set"))?;
    let root = entry
        .root
        .clone()
        .filter(|root| !root.as_os_str().is_empty())
        .ok_or_else(|| misconfigured("root is not set"))?;
    Ok((bucket.to_string(), root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::FakeDestination;
    use crate::sync::transfer::TransferLimits;
    use std::time::Duration;
    use tempfile::tempdir;

    fn gate() -> TransferGate {
        TransferGate::with_limits(TransferLimits {
            download_concurrency: 2,
            upload_concurrency: 4,
        })
    }

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn misconfigured_destinations_are_excluded() {
        let dir = tempdir().unwrap();
        let settings = vec![
            DestinationSettings {
                key: "aws_s3".into(),
                enabled: true,
                bucket: Some("backups".into()),
                root: Some(dir.path().to_path_buf()),
            },
            DestinationSettings {
                key: "backblaze_b2".into(),
                enabled: true,
                bucket: None,
                root: Some(dir.path().to_path_buf()),
            },
            DestinationSettings {
                key: "scaleway".into(),
                enabled: false,
                bucket: Some("x".into()),
                root: Some(dir.path().to_path_buf()),
            },
        ];
        let manager = DestinationManager::from_settings(&settings, gate());
        assert_eq!(manager.available_destinations(), keys(&["aws_s3"]));
        assert!(!manager.is_available("backblaze_b2"));
        assert!(!manager.is_available("scaleway"));
    }

    #[tokio::test]
    async fn exists_never_fails() {
        let broken = Arc::new(FakeDestination::new("b"));
        broken.set_probe_errors(true);
        let manager = DestinationManager::with_handles(
            vec![DestinationHandle::new("broken", broken)],
            gate(),
        );
        assert_eq!(manager.exists("ns/a", "broken").await, RemoteProbe::missing());
        assert_eq!(manager.exists("ns/a", "unknown").await, RemoteProbe::missing());
    }

    #[tokio::test]
    async fn partial_failure_reports_per_destination() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"12345").unwrap();

        let good = Arc::new(FakeDestination::new("good-bucket"));
        let bad = Arc::new(FakeDestination::new("bad-bucket"));
        bad.set_failing(true);
        let manager = DestinationManager::with_handles(
            vec![
                DestinationHandle::new("x", good.clone()),
                DestinationHandle::new("y", bad.clone()),
            ],
            gate(),
        );

        let result = manager
            .upload(&local, "ns/a.txt", &keys(&["x", "y", "missing"]))
            .await;
        assert!(result.success());
        assert!(!result.all_success());
        assert_eq!(result.destinations["x"].as_ref().unwrap().size, 5);
        assert!(result.destinations["y"].is_err());
        assert!(matches!(
            result.destinations["missing"],
            Err(DestinationError::Unavailable(_))
        ));
        assert_eq!(good.object_size("ns/a.txt"), Some(5));
    }

    #[tokio::test]
    async fn slow_destination_does_not_hold_back_others() {
        let dir = tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"1").unwrap();

        let slow = Arc::new(FakeDestination::new("slow").with_delay(Duration::from_millis(300)));
        let fast = Arc::new(FakeDestination::new("fast"));
        let manager = DestinationManager::with_handles(
            vec![
                DestinationHandle::new("slow", slow),
                DestinationHandle::new("fast", fast),
            ],
            gate(),
        );

        let destinations = keys(&["slow", "fast"]);
        let mut stream = manager.upload_stream(&local, "ns/a.txt", &destinations);
        let (first, result) = stream.next().await.unwrap();
        assert_eq!(first, "fast");
        assert!(result.is_ok());
        let (second, _) = stream.next().await.unwrap();
        assert_eq!(second, "slow");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn destination_info_includes_excluded_entries() {
        let dir = tempdir().unwrap();
        let settings = vec![
            DestinationSettings {
                key: "aws_s3".into(),
                enabled: true,
                bucket: Some("backups".into()),
                root: Some(dir.path().to_path_buf()),
            },
            DestinationSettings {
                key: "backblaze_b2".into(),
                enabled: true,
                bucket: Some("b2".into()),
                root: None,
            },
        ];
        let manager = DestinationManager::from_settings(&settings, gate());
        let info = manager.destination_info().await;
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].key, "aws_s3");
        assert_eq!(info[0].usage, Some(BucketUsage::default()));
        assert!(!info[1].available);
        assert_eq!(info[1].error.as_deref(), Some("root is not set"));

        assert!(manager.list_files("", "aws_s3").await.unwrap().is_empty());
        assert!(matches!(
            manager.bucket_size("backblaze_b2").await,
            Err(DestinationError::Unavailable(_))
        ));
    }
}
