use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use driveback_core::{ConnectorError, DestinationConnector, SourceConnector, UploadReceipt};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("downloaded size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            download_concurrency: read_limit("DRIVEBACK_DOWNLOAD_CONCURRENCY", 4),
            upload_concurrency: read_limit("DRIVEBACK_UPLOAD_CONCURRENCY", 2),
        }
    }
}

/// Process-wide caps on simultaneous downloads and uploads, shared by every
/// sync worker and every destination.
#[derive(Clone)]
pub struct TransferGate {
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

impl TransferGate {
    pub fn new() -> Self {
        Self::with_limits(TransferLimits::default())
    }

    pub fn with_limits(limits: TransferLimits) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(limits.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(limits.upload_concurrency.max(1))),
        }
    }

    /// Downloads `item_id` into `dest_dir`. When `expected_size` is given the
    /// written file must match it; a mismatching file is removed.
    pub async fn download(
        &self,
        source: &dyn SourceConnector,
        item_id: &str,
        dest_dir: &Path,
        expected_size: Option<u64>,
    ) -> Result<PathBuf, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let local = source.download(item_id, dest_dir).await?;

        if let Some(expected) = expected_size {
            let actual = tokio::fs::metadata(&local).await?.len();
            if actual != expected {
                let _ = tokio::fs::remove_file(&local).await;
                return Err(TransferError::SizeMismatch { expected, actual });
            }
        }
        Ok(local)
    }

    pub async fn upload(
        &self,
        destination: &dyn DestinationConnector,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadReceipt, TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        Ok(destination.upload(local_path, remote_path).await?)
    }

    pub fn close(&self) {
        self.download_limit.close();
        self.upload_limit.close();
    }
}

impl Default for TransferGate {
    fn default() -> Self {
        Self::new()
    }
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
