use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use crate::destination::{BucketUsage, DestinationConnector, RemoteEntry, RemoteProbe, UploadReceipt};
use crate::error::ConnectorError;
use crate::source::{ChildPage, ItemMetadata, SourceConnector};

/// Item id of the top-level container of a [`LocalTreeSource`].
pub const ROOT_CONTAINER_ID: &str = "root";

const DEFAULT_PAGE_SIZE: usize = 100;

/// Source connector over a directory tree. Item ids are `/`-separated paths
/// relative to the tree root; the root itself is [`ROOT_CONTAINER_ID`].
#[derive(Debug, Clone)]
pub struct LocalTreeSource {
    root: PathBuf,
    root_name: String,
    page_size: usize,
}

impl LocalTreeSource {
    pub fn new(root: impl Into<PathBuf>, root_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            root_name: root_name.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn local_path(&self, item_id: &str) -> Result<PathBuf, ConnectorError> {
        if item_id == ROOT_CONTAINER_ID {
            return Ok(self.root.clone());
        }
        join_relative(&self.root, item_id)
    }
}

#[async_trait]
impl SourceConnector for LocalTreeSource {
    async fn get_metadata(&self, item_id: &str) -> Result<ItemMetadata, ConnectorError> {
        let path = self.local_path(item_id)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| not_found_or_io(err, item_id))?;

        let (name, parent_ids) = if item_id == ROOT_CONTAINER_ID {
            (self.root_name.clone(), Vec::new())
        } else {
            let trimmed = item_id.trim_matches('/');
            match trimmed.rsplit_once('/') {
                Some((parent, name)) => (name.to_string(), vec![parent.to_string()]),
                None => (trimmed.to_string(), vec![ROOT_CONTAINER_ID.to_string()]),
            }
        };

        Ok(ItemMetadata {
            id: item_id.to_string(),
            name,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_secs() as i64),
            parent_ids,
            is_container: meta.is_dir(),
        })
    }

    async fn download(&self, item_id: &str, dest_dir: &Path) -> Result<PathBuf, ConnectorError> {
        let source = self.local_path(item_id)?;
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|err| not_found_or_io(err, item_id))?;
        if meta.is_dir() {
            return Err(ConnectorError::InvalidPath(format!(
                "{item_id} is a container"
            )));
        }
        let name = source
            .file_name()
            .ok_or_else(|| ConnectorError::InvalidPath(item_id.to_string()))?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(name);
        tokio::fs::copy(&source, &target).await?;
        Ok(target)
    }

    async fn list_children(
        &self,
        container_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, ConnectorError> {
        let dir = self.local_path(container_id)?;
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ConnectorError::InvalidPath(format!("bad page token: {token}")))?,
            None => 0,
        };

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| not_found_or_io(err, container_id))?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let mut items = Vec::new();
        for name in names.iter().skip(offset).take(self.page_size) {
            let child_id = if container_id == ROOT_CONTAINER_ID {
                name.clone()
            } else {
                format!("{}/{}", container_id.trim_matches('/'), name)
            };
            items.push(self.get_metadata(&child_id).await?);
        }

        let consumed = offset + items.len();
        Ok(ChildPage {
            items,
            next_page_token: (consumed < names.len()).then(|| consumed.to_string()),
        })
    }
}

/// Destination connector writing objects into a local directory, such as a
/// mounted bucket.
#[derive(Debug, Clone)]
pub struct LocalDirDestination {
    root: PathBuf,
    bucket: String,
}

impl LocalDirDestination {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    async fn walk_files(&self, start: &Path) -> Result<Vec<RemoteEntry>, ConnectorError> {
        let mut stack = vec![start.to_path_buf()];
        let mut out = Vec::new();
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    stack.push(path);
                } else if !is_partial(&path) {
                    out.push(RemoteEntry {
                        path: relative_key(&self.root, &path),
                        size: meta.len(),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

#[async_trait]
impl DestinationConnector for LocalDirDestination {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, remote_path: &str) -> Result<RemoteProbe, ConnectorError> {
        let target = join_relative(&self.root, remote_path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Ok(RemoteProbe::found(meta.len())),
            Ok(_) => Ok(RemoteProbe::missing()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RemoteProbe::missing()),
            Err(err) => Err(err.into()),
        }
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<UploadReceipt, ConnectorError> {
        let target = join_relative(&self.root, remote_path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        let copied = match tokio::fs::copy(local_path, &partial).await {
            Ok(copied) => copied,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err.into());
            }
        };
        tokio::fs::rename(&partial, &target).await?;
        Ok(UploadReceipt { size: copied })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, ConnectorError> {
        let start = if prefix.trim_matches('/').is_empty() {
            self.root.clone()
        } else {
            join_relative(&self.root, prefix)?
        };
        match tokio::fs::metadata(&start).await {
            Ok(meta) if meta.is_file() => Ok(vec![RemoteEntry {
                path: relative_key(&self.root, &start),
                size: meta.len(),
            }]),
            Ok(_) => self.walk_files(&start).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn total_size(&self) -> Result<BucketUsage, ConnectorError> {
        let entries = self.walk_files(&self.root).await?;
        Ok(BucketUsage {
            count: entries.len() as u64,
            bytes: entries.iter().map(|entry| entry.size).sum(),
        })
    }
}

fn join_relative(root: &Path, relative: &str) -> Result<PathBuf, ConnectorError> {
    if relative.trim_matches('/').is_empty() {
        return Err(ConnectorError::InvalidPath("path is empty".into()));
    }
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ConnectorError::InvalidPath(relative.to_string()));
            }
        }
    }
    Ok(out)
}

fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

const PARTIAL_SUFFIX: &str = ".driveback-partial";

/// Hidden sibling of `target` that holds an upload until it is renamed.
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

fn is_partial(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX))
}

fn not_found_or_io(err: std::io::Error, id: &str) -> ConnectorError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ConnectorError::NotFound(id.to_string())
    } else {
        ConnectorError::Io(err)
    }
}
