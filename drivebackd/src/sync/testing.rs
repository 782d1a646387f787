use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use driveback_core::{
    BucketUsage, ChildPage, ConnectorError, DestinationConnector, ItemMetadata, RemoteEntry,
    RemoteProbe, SourceConnector, UploadReceipt,
};

pub const FAKE_ROOT_ID: &str = "root";
const FAKE_PAGE_SIZE: usize = 2;

#[derive(Default)]
struct FakeTree {
    items: HashMap<String, ItemMetadata>,
    children: BTreeMap<String, Vec<String>>,
}

/// In-memory source with a two-item page size.
pub struct FakeSource {
    tree: Mutex<FakeTree>,
    broken_containers: Mutex<HashSet<String>>,
    downloads: AtomicUsize,
    unauthenticated: AtomicBool,
}

impl FakeSource {
    pub fn new() -> Self {
        let mut tree = FakeTree::default();
        tree.items.insert(
            FAKE_ROOT_ID.to_string(),
            ItemMetadata {
                id: FAKE_ROOT_ID.to_string(),
                name: "My Drive".to_string(),
                size: 0,
                modified: None,
                parent_ids: Vec::new(),
                is_container: true,
            },
        );
        Self {
            tree: Mutex::new(tree),
            broken_containers: Mutex::new(HashSet::new()),
            downloads: AtomicUsize::new(0),
            unauthenticated: AtomicBool::new(false),
        }
    }

    pub fn add_folder(&self, id: &str, name: &str, parent: &str) {
        self.insert(id, name, parent, 0, true);
    }

    pub fn add_file(&self, id: &str, name: &str, parent: &str, size: u64) {
        self.insert(id, name, parent, size, false);
    }

    fn insert(&self, id: &str, name: &str, parent: &str, size: u64, is_container: bool) {
        let mut tree = self.tree.lock().unwrap();
        tree.items.insert(
            id.to_string(),
            ItemMetadata {
                id: id.to_string(),
                name: name.to_string(),
                size,
                modified: Some(1_700_000_000),
                parent_ids: vec![parent.to_string()],
                is_container,
            },
        );
        tree.children
            .entry(parent.to_string())
            .or_default()
            .push(id.to_string());
    }

    pub fn break_container(&self, id: &str) {
        self.broken_containers.lock().unwrap().insert(id.to_string());
    }

    pub fn set_unauthenticated(&self, value: bool) {
        self.unauthenticated.store(value, Ordering::SeqCst);
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn check_auth(&self) -> Result<(), ConnectorError> {
        if self.unauthenticated.load(Ordering::SeqCst) {
            return Err(ConnectorError::NotAuthenticated("token expired".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for FakeSource {
    async fn get_metadata(&self, item_id: &str) -> Result<ItemMetadata, ConnectorError> {
        self.check_auth()?;
        self.tree
            .lock()
            .unwrap()
            .items
            .get(item_id)
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(item_id.to_string()))
    }

    async fn download(&self, item_id: &str, dest_dir: &Path) -> Result<PathBuf, ConnectorError> {
        self.check_auth()?;
        let meta = self.get_metadata(item_id).await?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(&meta.name);
        tokio::fs::write(&target, vec![b'x'; meta.size as usize]).await?;
        Ok(target)
    }

    async fn list_children(
        &self,
        container_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, ConnectorError> {
        self.check_auth()?;
        if self.broken_containers.lock().unwrap().contains(container_id) {
            return Err(ConnectorError::Backend(format!("{container_id} unreadable")));
        }
        let offset = page_token
            .map(|token| token.parse::<usize>().unwrap_or(0))
            .unwrap_or(0);
        let tree = self.tree.lock().unwrap();
        if !tree.items.contains_key(container_id) {
            return Err(ConnectorError::NotFound(container_id.to_string()));
        }
        let ids = tree.children.get(container_id).cloned().unwrap_or_default();
        let items: Vec<ItemMetadata> = ids
            .iter()
            .skip(offset)
            .take(FAKE_PAGE_SIZE)
            .filter_map(|id| tree.items.get(id).cloned())
            .collect();
        let consumed = offset + FAKE_PAGE_SIZE;
        Ok(ChildPage {
            items,
            next_page_token: (consumed < ids.len()).then(|| consumed.to_string()),
        })
    }
}

/// Recording destination keeping object sizes in memory.
pub struct FakeDestination {
    bucket: String,
    objects: Mutex<HashMap<String, u64>>,
    uploads: AtomicUsize,
    probes: AtomicUsize,
    failing: AtomicBool,
    probe_errors: AtomicBool,
    delay: Option<Duration>,
}

impl FakeDestination {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(HashMap::new()),
            uploads: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            probe_errors: AtomicBool::new(false),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn put(&self, path: &str, size: u64) {
        self.objects.lock().unwrap().insert(path.to_string(), size);
    }

    pub fn set_failing(&self, value: bool) {
        self.failing.store(value, Ordering::SeqCst);
    }

    pub fn set_probe_errors(&self, value: bool) {
        self.probe_errors.store(value, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn object_size(&self, path: &str) -> Option<u64> {
        self.objects.lock().unwrap().get(path).copied()
    }
}

#[async_trait]
impl DestinationConnector for FakeDestination {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, remote_path: &str) -> Result<RemoteProbe, ConnectorError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_errors.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unavailable("probe failed".into()));
        }
        Ok(match self.object_size(remote_path) {
            Some(size) => RemoteProbe::found(size),
            None => RemoteProbe::missing(),
        })
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadReceipt, ConnectorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectorError::Backend(format!("{} rejected upload", self.bucket)));
        }
        let size = tokio::fs::metadata(local_path).await?.len();
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.put(remote_path, size);
        Ok(UploadReceipt { size })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, ConnectorError> {
        let mut entries: Vec<RemoteEntry> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, size)| RemoteEntry {
                path: path.clone(),
                size: *size,
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn total_size(&self) -> Result<BucketUsage, ConnectorError> {
        if self.probe_errors.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unavailable("usage unavailable".into()));
        }
        let objects = self.objects.lock().unwrap();
        Ok(BucketUsage {
            count: objects.len() as u64,
            bytes: objects.values().sum(),
        })
    }
}
