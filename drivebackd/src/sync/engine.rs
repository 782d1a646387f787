use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use driveback_core::{ConnectorError, ErrorClass, ItemMetadata, SourceConnector};
use futures_util::future::join_all;
use futures_util::stream::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::fanout::{DestinationError, DestinationManager};
use super::ledger::{TransferLedger, TransferStatus, TransferUpdate};
use super::paths::{PathLayout, join_source_path};
use super::policy::{PolicySet, PolicyStore};
use super::scratch::ScratchDir;
use super::transfer::{TransferError, TransferGate};
use super::walker::{TreeWalk, TreeWalker, WalkedItem};
use crate::store::StoreError;

/// Parent hops followed when building an item's source path.
pub const MAX_PARENT_HOPS: usize = 100;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("source error: {0}")]
    Source(#[from] ConnectorError),
}

/// Why one item or one destination did not sync.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SyncFailure {
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncFailure {
    pub fn from_connector(err: &ConnectorError) -> Self {
        match err.classification() {
            ErrorClass::Auth => SyncFailure::NotAuthenticated(err.to_string()),
            ErrorClass::NotFound => SyncFailure::NotFound(err.to_string()),
            ErrorClass::Transient | ErrorClass::Permanent => SyncFailure::Transfer(err.to_string()),
        }
    }

    fn from_transfer(err: &TransferError) -> Self {
        match err {
            TransferError::Connector(err) => Self::from_connector(err),
            other => SyncFailure::Transfer(other.to_string()),
        }
    }

    fn from_destination(err: &DestinationError) -> Self {
        match err {
            DestinationError::Unavailable(_) | DestinationError::Misconfigured { .. } => {
                SyncFailure::Configuration(err.to_string())
            }
            DestinationError::Transfer(err) => Self::from_transfer(err),
            DestinationError::Connector(err) => Self::from_connector(err),
        }
    }

    fn from_engine(err: &EngineError) -> Self {
        match err {
            EngineError::Source(err) => Self::from_connector(err),
            other => SyncFailure::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No enabled policy covers the item's path.
    NoPolicy,
    /// Containers are expanded, never transferred.
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// At least one destination received the file in this attempt.
    Synced,
    /// Every destination already held a same-size copy.
    Deduplicated,
    Skipped(SkipReason),
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DestinationOutcome {
    AlreadyPresent { size: u64 },
    Uploaded { size: u64 },
    Failed { error: SyncFailure },
}

impl DestinationOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, DestinationOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSyncReport {
    pub item_id: String,
    pub name: Option<String>,
    pub remote_path: Option<String>,
    pub status: ItemStatus,
    pub success: bool,
    pub all_success: bool,
    pub destinations: BTreeMap<String, DestinationOutcome>,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    pub error: Option<SyncFailure>,
}

impl ItemSyncReport {
    fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            name: None,
            remote_path: None,
            status: ItemStatus::Failed,
            success: false,
            all_success: false,
            destinations: BTreeMap::new(),
            bytes_transferred: 0,
            bytes_saved: 0,
            error: None,
        }
    }

    fn failed(item_id: &str, error: SyncFailure) -> Self {
        let mut report = Self::new(item_id);
        report.error = Some(error);
        report
    }

    fn skipped(mut self, reason: SkipReason) -> Self {
        self.status = ItemStatus::Skipped(reason);
        self.success = true;
        self.all_success = true;
        self
    }

    /// Derives the flags and status from the per-destination outcomes.
    fn settle(&mut self, all_present: bool) {
        self.success = self.destinations.values().any(DestinationOutcome::is_ok);
        self.all_success = !self.destinations.is_empty()
            && self.destinations.values().all(DestinationOutcome::is_ok);
        self.status = if all_present && self.all_success {
            ItemStatus::Deduplicated
        } else if self.success {
            ItemStatus::Synced
        } else {
            ItemStatus::Failed
        };
        if !self.success && self.error.is_none() {
            self.error = self.destinations.values().find_map(|outcome| match outcome {
                DestinationOutcome::Failed { error } => Some(error.clone()),
                _ => None,
            });
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: u64,
    pub synced: u64,
    pub deduplicated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    /// Sub-containers the walker could not list.
    pub skipped_containers: Vec<String>,
    pub items: Vec<ItemSyncReport>,
}

impl BatchReport {
    pub fn add(&mut self, report: ItemSyncReport) {
        self.total += 1;
        match report.status {
            ItemStatus::Synced => self.synced += 1,
            ItemStatus::Deduplicated => self.deduplicated += 1,
            ItemStatus::Skipped(_) => self.skipped += 1,
            ItemStatus::Failed => self.failed += 1,
        }
        self.bytes_transferred += report.bytes_transferred;
        self.bytes_saved += report.bytes_saved;
        self.items.push(report);
    }
}

/// One unit of daemon work: either an item already expanded by the walker
/// or a bare id that still needs its metadata and path.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Walked(WalkedItem),
    Id(String),
}

impl WorkItem {
    pub fn item_id(&self) -> &str {
        match self {
            WorkItem::Walked(walked) => &walked.item.id,
            WorkItem::Id(id) => id,
        }
    }
}

/// Copies single items from the source to their policy destinations and
/// records every outcome in the ledger.
///
/// Destinations that already hold a same-size copy are excluded from the
/// upload and recorded as synced with the existing size. The size check is a
/// heuristic: different content of equal length counts as present.
pub struct ItemSyncEngine {
    source: Arc<dyn SourceConnector>,
    destinations: DestinationManager,
    policies: PolicyStore,
    ledger: TransferLedger,
    layout: PathLayout,
    scratch_root: PathBuf,
    gate: TransferGate,
    walker: TreeWalker,
    container_paths: Mutex<HashMap<String, String>>,
}

impl ItemSyncEngine {
    pub fn new(
        source: Arc<dyn SourceConnector>,
        destinations: DestinationManager,
        policies: PolicyStore,
        ledger: TransferLedger,
        layout: PathLayout,
        scratch_root: PathBuf,
    ) -> Self {
        Self {
            walker: TreeWalker::new(source.clone()),
            gate: destinations.gate().clone(),
            source,
            destinations,
            policies,
            ledger,
            layout,
            scratch_root,
            container_paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn destinations(&self) -> &DestinationManager {
        &self.destinations
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    /// Forgets memoized container paths so renames at the source are picked
    /// up by the next pass.
    pub fn begin_pass(&self) {
        if let Ok(mut cache) = self.container_paths.lock() {
            cache.clear();
        }
    }

    pub async fn policy_snapshot(&self) -> Result<PolicySet, EngineError> {
        Ok(self.policies.snapshot().await?)
    }

    pub async fn sync_item(
        &self,
        item_id: &str,
        explicit_destinations: Option<&[String]>,
    ) -> ItemSyncReport {
        let policies = match self.policy_snapshot().await {
            Ok(policies) => policies,
            Err(err) => {
                error!(item_id, error = %err, "failed to load policies");
                return ItemSyncReport::failed(item_id, SyncFailure::from_engine(&err));
            }
        };
        self.sync_with(item_id, explicit_destinations, &policies).await
    }

    pub async fn sync_many(&self, item_ids: &[String]) -> Result<BatchReport, EngineError> {
        let policies = self.policy_snapshot().await?;
        let mut batch = BatchReport::default();
        for item_id in item_ids {
            batch.add(self.sync_with(item_id, None, &policies).await);
        }
        info!(
            total = batch.total,
            synced = batch.synced,
            deduplicated = batch.deduplicated,
            failed = batch.failed,
            "batch finished"
        );
        Ok(batch)
    }

    pub async fn sync_container(&self, container_id: &str) -> Result<BatchReport, EngineError> {
        let policies = self.policy_snapshot().await?;
        let walk = self.expand_container(container_id).await?;
        let mut batch = BatchReport {
            skipped_containers: walk.skipped_containers,
            ..BatchReport::default()
        };
        for walked in walk.items {
            batch.add(self.sync_walked(walked, &policies).await);
        }
        info!(
            container_id,
            total = batch.total,
            synced = batch.synced,
            deduplicated = batch.deduplicated,
            failed = batch.failed,
            "container synced"
        );
        Ok(batch)
    }

    /// Leaf items below `container_id` with their full source paths.
    pub async fn expand_container(&self, container_id: &str) -> Result<TreeWalk, EngineError> {
        let container = self.source.get_metadata(container_id).await?;
        let base_path = self.source_path(&container).await?;
        self.remember_container(container_id, &base_path);
        Ok(self.walker.walk(container_id, &base_path).await?)
    }

    pub async fn sync_work(&self, work: WorkItem, policies: &PolicySet) -> ItemSyncReport {
        match work {
            WorkItem::Walked(walked) => self.sync_walked(walked, policies).await,
            WorkItem::Id(item_id) => self.sync_with(&item_id, None, policies).await,
        }
    }

    /// Fails the pending ledger rows of a retried item that this attempt did
    /// not rewrite, so a retry that cannot run does not stay pending forever.
    pub async fn settle_pending(&self, report: &ItemSyncReport) {
        let failure = match (&report.error, report.status) {
            (Some(error), _) => error.clone(),
            (None, ItemStatus::Skipped(SkipReason::NoPolicy)) => {
                SyncFailure::Configuration("no enabled policy covers this item".to_string())
            }
            (None, ItemStatus::Skipped(SkipReason::Container)) => {
                SyncFailure::Configuration("item is a container".to_string())
            }
            (None, _) => SyncFailure::Configuration(
                "destination is no longer targeted for this item".to_string(),
            ),
        };
        match self
            .ledger
            .fail_pending(&report.item_id, &failure.to_string())
            .await
        {
            Ok(0) => {}
            Ok(count) => warn!(
                item_id = report.item_id.as_str(),
                count,
                error = %failure,
                "pending transfers settled as failed"
            ),
            Err(err) => error!(
                item_id = report.item_id.as_str(),
                error = %err,
                "failed to settle pending transfers"
            ),
        }
    }

    async fn sync_walked(&self, walked: WalkedItem, policies: &PolicySet) -> ItemSyncReport {
        let remote_path = self.layout.remote_path(&walked.path);
        self.sync_resolved(walked.item, remote_path, None, policies)
            .await
    }

    async fn sync_with(
        &self,
        item_id: &str,
        explicit_destinations: Option<&[String]>,
        policies: &PolicySet,
    ) -> ItemSyncReport {
        let item = match self.source.get_metadata(item_id).await {
            Ok(item) => item,
            Err(err) => {
                warn!(item_id, error = %err, "failed to read item metadata");
                return ItemSyncReport::failed(item_id, SyncFailure::from_connector(&err));
            }
        };
        let source_path = match self.source_path(&item).await {
            Ok(path) => path,
            Err(err) => {
                warn!(item_id, error = %err, "failed to resolve item path");
                let mut report = ItemSyncReport::failed(item_id, SyncFailure::from_engine(&err));
                report.name = Some(item.name);
                return report;
            }
        };
        let remote_path = self.layout.remote_path(&source_path);
        self.sync_resolved(item, remote_path, explicit_destinations, policies)
            .await
    }

    async fn sync_resolved(
        &self,
        item: ItemMetadata,
        remote_path: String,
        explicit_destinations: Option<&[String]>,
        policies: &PolicySet,
    ) -> ItemSyncReport {
        let mut report = ItemSyncReport::new(&item.id);
        report.name = Some(item.name.clone());
        report.remote_path = Some(remote_path.clone());

        if item.is_container {
            return report.skipped(SkipReason::Container);
        }

        let targets = match explicit_destinations {
            Some(explicit) => dedup_keys(explicit),
            None => dedup_keys(&policies.resolve(&remote_path)),
        };
        if targets.is_empty() {
            debug!(item_id = item.id.as_str(), remote_path, "no policy, skipping");
            return report.skipped(SkipReason::NoPolicy);
        }

        let probes = join_all(
            targets
                .iter()
                .map(|key| self.destinations.exists(&remote_path, key)),
        )
        .await;
        let mut needing = Vec::new();
        for (key, probe) in targets.iter().zip(probes) {
            if probe.matches_size(item.size) {
                report
                    .destinations
                    .insert(key.clone(), DestinationOutcome::AlreadyPresent { size: item.size });
                self.record(
                    &mut report,
                    &item,
                    key,
                    TransferStatus::Synced,
                    Some(item.size),
                    None,
                )
                .await;
            } else {
                needing.push(key.clone());
            }
        }

        if needing.is_empty() {
            report.bytes_saved = item.size;
            report.settle(true);
            info!(
                item_id = item.id.as_str(),
                remote_path,
                destinations = targets.len(),
                "already present everywhere"
            );
            return report;
        }

        self.transfer(&mut report, &item, &remote_path, &needing).await;
        report.settle(false);
        info!(
            item_id = item.id.as_str(),
            remote_path,
            success = report.success,
            all_success = report.all_success,
            bytes = report.bytes_transferred,
            "item synced"
        );
        report
    }

    /// Downloads once and uploads to `needing`, recording each destination as
    /// soon as it finishes. The scratch directory is removed on every path.
    async fn transfer(
        &self,
        report: &mut ItemSyncReport,
        item: &ItemMetadata,
        remote_path: &str,
        needing: &[String],
    ) {
        let scratch = match ScratchDir::create(&self.scratch_root).await {
            Ok(scratch) => scratch,
            Err(err) => {
                error!(item_id = item.id.as_str(), error = %err, "scratch directory unavailable");
                let failure = SyncFailure::Internal(err.to_string());
                self.fail_all(report, item, needing, &failure).await;
                return;
            }
        };

        let expected_size = (item.size > 0).then_some(item.size);
        let local = match self
            .gate
            .download(self.source.as_ref(), &item.id, scratch.path(), expected_size)
            .await
        {
            Ok(local) => local,
            Err(err) => {
                warn!(item_id = item.id.as_str(), error = %err, "download failed");
                let failure = SyncFailure::from_transfer(&err);
                self.fail_all(report, item, needing, &failure).await;
                scratch.remove().await;
                return;
            }
        };

        let mut uploads = self.destinations.upload_stream(&local, remote_path, needing);
        while let Some((key, result)) = uploads.next().await {
            match result {
                Ok(receipt) => {
                    report.bytes_transferred += receipt.size;
                    report
                        .destinations
                        .insert(key.clone(), DestinationOutcome::Uploaded { size: receipt.size });
                    self.record(report, item, &key, TransferStatus::Synced, Some(receipt.size), None)
                        .await;
                }
                Err(err) => {
                    let failure = SyncFailure::from_destination(&err);
                    report.destinations.insert(
                        key.clone(),
                        DestinationOutcome::Failed {
                            error: failure.clone(),
                        },
                    );
                    self.record(report, item, &key, TransferStatus::Failed, None, Some(&failure))
                        .await;
                }
            }
        }
        drop(uploads);
        scratch.remove().await;
    }

    async fn fail_all(
        &self,
        report: &mut ItemSyncReport,
        item: &ItemMetadata,
        keys: &[String],
        failure: &SyncFailure,
    ) {
        for key in keys {
            report.destinations.insert(
                key.clone(),
                DestinationOutcome::Failed {
                    error: failure.clone(),
                },
            );
            self.record(report, item, key, TransferStatus::Failed, None, Some(failure))
                .await;
        }
        report.error = Some(failure.clone());
    }

    async fn record(
        &self,
        report: &mut ItemSyncReport,
        item: &ItemMetadata,
        destination: &str,
        status: TransferStatus,
        size: Option<u64>,
        failure: Option<&SyncFailure>,
    ) {
        let update = TransferUpdate {
            item_name: Some(item.name.clone()),
            remote_path: report.remote_path.clone(),
            size,
            error: failure.map(ToString::to_string),
        };
        if let Err(err) = self
            .ledger
            .record_status(&item.id, destination, status, update)
            .await
        {
            error!(
                item_id = item.id.as_str(),
                destination,
                error = %err,
                "failed to record transfer status"
            );
            if report.error.is_none() {
                report.error = Some(SyncFailure::Internal(err.to_string()));
            }
        }
    }

    /// Source path of `item` (container names from the root down, then the
    /// item's own name), following at most [`MAX_PARENT_HOPS`] parents.
    async fn source_path(&self, item: &ItemMetadata) -> Result<String, EngineError> {
        let mut chain: Vec<(String, String)> = Vec::new();
        let mut prefix = String::new();
        let mut seen = HashSet::new();
        let mut parent = item.parent_ids.first().cloned();

        while let Some(parent_id) = parent.take() {
            if let Some(cached) = self.cached_container(&parent_id) {
                prefix = cached;
                break;
            }
            if chain.len() >= MAX_PARENT_HOPS || !seen.insert(parent_id.clone()) {
                warn!(
                    item_id = item.id.as_str(),
                    hops = chain.len(),
                    "parent chain truncated"
                );
                break;
            }
            let meta = self.source.get_metadata(&parent_id).await?;
            parent = meta.parent_ids.first().cloned();
            chain.push((parent_id, meta.name));
        }

        let mut path = prefix;
        for (container_id, name) in chain.into_iter().rev() {
            path = join_source_path(&path, &name);
            self.remember_container(&container_id, &path);
        }
        Ok(join_source_path(&path, &item.name))
    }

    fn cached_container(&self, container_id: &str) -> Option<String> {
        self.container_paths
            .lock()
            .ok()
            .and_then(|cache| cache.get(container_id).cloned())
    }

    fn remember_container(&self, container_id: &str, path: &str) {
        if let Ok(mut cache) = self.container_paths.lock() {
            cache.insert(container_id.to_string(), path.to_string());
        }
    }
}

fn dedup_keys(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .filter(|key| seen.insert(key.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
