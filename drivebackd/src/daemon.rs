use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use driveback_core::LocalTreeSource;
use tracing::{info, warn};

use crate::control::SyncControl;
use crate::store::{StateDb, default_db_path};
use crate::sync::fanout::{DestinationManager, DestinationSettings};
use crate::sync::paths::PathLayout;
use crate::sync::scheduler::DaemonSettings;
use crate::sync::transfer::{TransferGate, TransferLimits};

const DEFAULT_SOURCE_DIR_NAME: &str = "Drive";
const DEFAULT_SOURCE_ROOT_NAME: &str = "My Drive";
const DEFAULT_NAMESPACE: &str = "google-drive";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_PAUSE_POLL_MS: u64 = 10_000;
const DEFAULT_IDLE_POLL_MS: u64 = 30_000;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_SYNC_WORKERS: u64 = 1;
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 4;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub source_root: PathBuf,
    pub source_root_name: String,
    pub scratch_root: PathBuf,
    pub namespace: String,
    pub root_aliases: Vec<String>,
    pub sync_interval: Duration,
    pub pause_poll: Duration,
    pub idle_poll: Duration,
    pub stop_timeout: Duration,
    pub sync_workers: usize,
    pub transfer_limits: TransferLimits,
    pub auto_start: bool,
    pub destinations: Vec<DestinationSettings>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let db_path = match std::env::var("DRIVEBACK_DB_PATH") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_db_path().context("failed to resolve database path")?,
        };
        let source_root = std::env::var("DRIVEBACK_SOURCE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SOURCE_DIR_NAME));
        let source_root_name = std::env::var("DRIVEBACK_SOURCE_ROOT_NAME")
            .unwrap_or_else(|_| DEFAULT_SOURCE_ROOT_NAME.to_string());
        let scratch_root = std::env::var("DRIVEBACK_SCRATCH_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_scratch_root);
        let namespace =
            std::env::var("DRIVEBACK_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let root_aliases = std::env::var("DRIVEBACK_ROOT_ALIASES")
            .map(|value| split_list(&value))
            .unwrap_or_else(|_| vec![DEFAULT_SOURCE_ROOT_NAME.to_string()]);

        let destination_keys = std::env::var("DRIVEBACK_DESTINATIONS")
            .map(|value| split_list(&value))
            .unwrap_or_default();
        let destinations = destination_settings(&destination_keys, &home, |name| {
            std::env::var(name).ok()
        });

        Ok(Self {
            db_path,
            source_root,
            source_root_name,
            scratch_root,
            namespace,
            root_aliases,
            sync_interval: Duration::from_secs(read_u64_env(
                "DRIVEBACK_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            pause_poll: Duration::from_millis(read_u64_env(
                "DRIVEBACK_PAUSE_POLL_MS",
                DEFAULT_PAUSE_POLL_MS,
            )),
            idle_poll: Duration::from_millis(read_u64_env(
                "DRIVEBACK_IDLE_POLL_MS",
                DEFAULT_IDLE_POLL_MS,
            )),
            stop_timeout: Duration::from_secs(read_u64_env(
                "DRIVEBACK_STOP_TIMEOUT_SECS",
                DEFAULT_STOP_TIMEOUT_SECS,
            )),
            sync_workers: read_u64_env("DRIVEBACK_SYNC_WORKERS", DEFAULT_SYNC_WORKERS) as usize,
            transfer_limits: TransferLimits {
                download_concurrency: read_u64_env(
                    "DRIVEBACK_DOWNLOAD_CONCURRENCY",
                    DEFAULT_DOWNLOAD_CONCURRENCY,
                ) as usize,
                upload_concurrency: read_u64_env(
                    "DRIVEBACK_UPLOAD_CONCURRENCY",
                    DEFAULT_UPLOAD_CONCURRENCY,
                ) as usize,
            },
            auto_start: read_bool_env("DRIVEBACK_AUTO_START", true),
            destinations,
        })
    }

    pub fn daemon_settings(&self) -> DaemonSettings {
        DaemonSettings {
            sync_interval: self.sync_interval,
            pause_poll: self.pause_poll,
            idle_poll: self.idle_poll,
            stop_timeout: self.stop_timeout,
            workers: self.sync_workers.max(1),
            ..DaemonSettings::default()
        }
    }

    pub fn layout(&self) -> PathLayout {
        PathLayout::new(self.namespace.clone(), self.root_aliases.clone())
    }
}

/// Composition root: opens the state database, builds the connectors and
/// hands them to a [`SyncControl`].
pub struct DaemonRuntime {
    config: DaemonConfig,
    control: Arc<SyncControl>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.scratch_root)
            .await
            .with_context(|| format!("failed to create scratch root at {:?}", config.scratch_root))?;
        let db = StateDb::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open state database at {:?}", config.db_path))?;

        if !config.source_root.is_dir() {
            warn!(
                source_root = %config.source_root.display(),
                "source directory does not exist yet"
            );
        }
        let source = Arc::new(LocalTreeSource::new(
            config.source_root.clone(),
            config.source_root_name.clone(),
        ));
        let gate = TransferGate::with_limits(config.transfer_limits);
        let destinations = DestinationManager::from_settings(&config.destinations, gate);
        if destinations.available_destinations().is_empty() {
            warn!("no destinations are available; items will fail until one is configured");
        }

        let control = SyncControl::new(
            &db,
            source,
            destinations,
            config.layout(),
            config.scratch_root.clone(),
            config.daemon_settings(),
        );
        Ok(Self {
            config,
            control: Arc::new(control),
        })
    }

    pub fn control(&self) -> Arc<SyncControl> {
        self.control.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            source_root = %self.config.source_root.display(),
            db_path = %self.config.db_path.display(),
            namespace = self.config.namespace.as_str(),
            destinations = ?self.control.available_destinations(),
            "drivebackd started"
        );
        if self.config.auto_start {
            self.control.start().await;
        } else {
            info!("auto start disabled, daemon stays stopped");
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown requested");
        self.control.stop().await;
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
