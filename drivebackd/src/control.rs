use std::path::PathBuf;
use std::sync::Arc;

use driveback_core::{BucketUsage, RemoteEntry, SourceConnector};
use thiserror::Error;

use crate::store::{StateDb, StoreError};
use crate::sync::engine::{BatchReport, EngineError, ItemSyncEngine, ItemSyncReport};
use crate::sync::fanout::{DestinationError, DestinationInfo, DestinationManager};
use crate::sync::ledger::{FolderStat, StatusCounts, TransferLedger, TransferRecord, TransferStatus};
use crate::sync::paths::PathLayout;
use crate::sync::policy::{FolderPolicy, PolicyStore};
use crate::sync::scheduler::{DaemonSettings, DaemonStatus, SyncDaemon};
use crate::sync::selection::{SelectedRoot, SelectionStore};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
}

/// Operations exposed to the outer CLI or HTTP layer. Owns every service
/// of one process; nothing here is global.
pub struct SyncControl {
    daemon: SyncDaemon,
    engine: Arc<ItemSyncEngine>,
    policies: PolicyStore,
    ledger: TransferLedger,
    selection: SelectionStore,
    layout: PathLayout,
}

impl SyncControl {
    pub fn new(
        db: &StateDb,
        source: Arc<dyn SourceConnector>,
        destinations: DestinationManager,
        layout: PathLayout,
        scratch_root: PathBuf,
        settings: DaemonSettings,
    ) -> Self {
        let policies = PolicyStore::new(db.pool().clone(), layout.clone());
        let ledger = TransferLedger::new(db.pool().clone());
        let selection = SelectionStore::new(db.pool().clone());
        let engine = Arc::new(ItemSyncEngine::new(
            source,
            destinations,
            policies.clone(),
            ledger.clone(),
            layout.clone(),
            scratch_root,
        ));
        let daemon = SyncDaemon::new(engine.clone(), selection.clone(), ledger.clone(), settings);
        Self {
            daemon,
            engine,
            policies,
            ledger,
            selection,
            layout,
        }
    }

    pub async fn start(&self) -> bool {
        self.daemon.start().await
    }

    pub async fn stop(&self) -> bool {
        self.daemon.stop().await
    }

    pub async fn pause(&self) -> bool {
        self.daemon.pause().await
    }

    pub async fn resume(&self) -> bool {
        self.daemon.resume().await
    }

    pub fn status(&self) -> DaemonStatus {
        self.daemon.status()
    }

    pub async fn run_once(&self) -> Result<BatchReport, ControlError> {
        Ok(self.daemon.run_once().await?)
    }

    pub async fn list_by_status(
        &self,
        status: TransferStatus,
    ) -> Result<Vec<TransferRecord>, ControlError> {
        Ok(self.ledger.list_by_status(status).await?)
    }

    pub async fn list_failed(&self) -> Result<Vec<TransferRecord>, ControlError> {
        self.list_by_status(TransferStatus::Failed).await
    }

    pub async fn mark_pending_for_retry(
        &self,
        item_id: &str,
        destination: &str,
    ) -> Result<bool, ControlError> {
        Ok(self.ledger.mark_pending_for_retry(item_id, destination).await?)
    }

    pub async fn mark_all_failed_pending(&self) -> Result<u64, ControlError> {
        Ok(self.ledger.mark_all_failed_pending().await?)
    }

    pub async fn purge_item(&self, item_id: &str) -> Result<u64, ControlError> {
        Ok(self.ledger.purge_item(item_id).await?)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, ControlError> {
        Ok(self.ledger.status_counts().await?)
    }

    pub async fn folder_stats(&self) -> Result<Vec<FolderStat>, ControlError> {
        Ok(self.ledger.folder_stats(&self.layout).await?)
    }

    pub async fn set_policy(
        &self,
        folder_id: &str,
        folder_name: &str,
        folder_path: &str,
        destinations: &[String],
    ) -> Result<FolderPolicy, ControlError> {
        Ok(self
            .policies
            .set_policy(folder_id, folder_name, folder_path, destinations)
            .await?)
    }

    pub async fn update_policy(
        &self,
        folder_id: &str,
        destinations: &[String],
    ) -> Result<(), ControlError> {
        Ok(self.policies.update_policy(folder_id, destinations).await?)
    }

    pub async fn remove_policy(&self, folder_id: &str) -> Result<bool, ControlError> {
        Ok(self.policies.remove_policy(folder_id).await?)
    }

    pub async fn set_policy_enabled(
        &self,
        folder_id: &str,
        enabled: bool,
    ) -> Result<(), ControlError> {
        Ok(self.policies.set_enabled(folder_id, enabled).await?)
    }

    pub async fn list_policies(&self) -> Result<Vec<FolderPolicy>, ControlError> {
        Ok(self.policies.list_policies().await?)
    }

    pub async fn add_selection(
        &self,
        item_id: &str,
        item_name: &str,
        is_container: bool,
    ) -> Result<bool, ControlError> {
        Ok(self.selection.add(item_id, item_name, is_container).await?)
    }

    pub async fn remove_selection(&self, item_id: &str) -> Result<bool, ControlError> {
        Ok(self.selection.remove(item_id).await?)
    }

    pub async fn list_selection(&self) -> Result<Vec<SelectedRoot>, ControlError> {
        Ok(self.selection.list().await?)
    }

    pub async fn clear_selection(&self) -> Result<u64, ControlError> {
        Ok(self.selection.clear().await?)
    }

    pub async fn sync_item(
        &self,
        item_id: &str,
        destinations: Option<&[String]>,
    ) -> ItemSyncReport {
        self.engine.sync_item(item_id, destinations).await
    }

    pub async fn sync_many(&self, item_ids: &[String]) -> Result<BatchReport, ControlError> {
        Ok(self.engine.sync_many(item_ids).await?)
    }

    pub async fn sync_container(&self, container_id: &str) -> Result<BatchReport, ControlError> {
        Ok(self.engine.sync_container(container_id).await?)
    }

    pub fn available_destinations(&self) -> Vec<String> {
        self.engine.destinations().available_destinations()
    }

    pub async fn destination_info(&self) -> Vec<DestinationInfo> {
        self.engine.destinations().destination_info().await
    }

    pub async fn list_files(
        &self,
        remote_path: &str,
        destination: &str,
    ) -> Result<Vec<RemoteEntry>, ControlError> {
        Ok(self
            .engine
            .destinations()
            .list_files(remote_path, destination)
            .await?)
    }

    pub async fn bucket_size(&self, destination: &str) -> Result<BucketUsage, ControlError> {
        Ok(self.engine.destinations().bucket_size(destination).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::engine::ItemStatus;
    use crate::sync::fanout::DestinationHandle;
    use crate::sync::testing::{FAKE_ROOT_ID, FakeDestination, FakeSource};
    use crate::sync::transfer::TransferGate;
    use tempfile::tempdir;

    #[tokio::test]
    async fn control_surface_drives_policy_sync_and_retry() {
        let db = StateDb::in_memory().await.unwrap();
        let scratch = tempdir().unwrap();
        let source = Arc::new(FakeSource::new());
        source.add_folder("f", "F", FAKE_ROOT_ID);
        source.add_file("report", "report.pdf", "f", 1000);
        let s3 = Arc::new(FakeDestination::new("s3"));
        let destinations = DestinationManager::with_handles(
            vec![DestinationHandle::new("aws_s3", s3.clone())],
            TransferGate::default(),
        );
        let control = SyncControl::new(
            &db,
            source,
            destinations,
            PathLayout::new("google-drive", vec!["My Drive".to_string()]),
            scratch.path().to_path_buf(),
            DaemonSettings::default(),
        );

        let destinations = vec!["aws_s3".to_string()];
        control
            .set_policy("f", "F", "My Drive/F", &destinations)
            .await
            .unwrap();
        assert_eq!(control.list_policies().await.unwrap().len(), 1);
        assert!(matches!(
            control.set_policy("f", "F", "My Drive/F", &destinations).await,
            Err(ControlError::Store(StoreError::PolicyExists(_)))
        ));

        s3.set_failing(true);
        let report = control.sync_item("report", None).await;
        assert_eq!(report.status, ItemStatus::Failed);
        assert_eq!(control.list_failed().await.unwrap().len(), 1);

        s3.set_failing(false);
        assert_eq!(control.mark_all_failed_pending().await.unwrap(), 1);
        let batch = control.run_once().await.unwrap();
        assert_eq!(batch.synced, 1);
        assert_eq!(control.status_counts().await.unwrap().synced, 1);
        assert_eq!(control.folder_stats().await.unwrap()[0].folder, "F");

        assert_eq!(control.available_destinations(), destinations);
        assert_eq!(control.bucket_size("aws_s3").await.unwrap().bytes, 1000);
        assert_eq!(
            control
                .list_files("google-drive", "aws_s3")
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(control.remove_policy("f").await.unwrap());
        assert_eq!(control.purge_item("report").await.unwrap(), 1);
    }
}
