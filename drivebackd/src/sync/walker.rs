use std::collections::HashSet;
use std::sync::Arc;

use driveback_core::{ConnectorError, ItemMetadata, SourceConnector};
use serde::Serialize;
use tracing::{debug, warn};

use super::paths::join_source_path;

/// A leaf item found under a walked container, with its source path
/// (container chain plus the item's own name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkedItem {
    pub item: ItemMetadata,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeWalk {
    pub items: Vec<WalkedItem>,
    /// Sub-containers that could not be listed and were skipped.
    pub skipped_containers: Vec<String>,
}

#[derive(Clone)]
pub struct TreeWalker {
    source: Arc<dyn SourceConnector>,
}

impl TreeWalker {
    pub fn new(source: Arc<dyn SourceConnector>) -> Self {
        Self { source }
    }

    /// Walks `container_id` using its own name as the path prefix.
    pub async fn list_recursive(&self, container_id: &str) -> Result<TreeWalk, ConnectorError> {
        let container = self.source.get_metadata(container_id).await?;
        self.walk(container_id, &container.name).await
    }

    /// Depth-first walk below `container_id`, whose source path is
    /// `base_path`. Only a failure to list the starting container is an
    /// error.
    pub async fn walk(&self, container_id: &str, base_path: &str) -> Result<TreeWalk, ConnectorError> {
        let mut out = TreeWalk::default();
        let mut visited = HashSet::new();
        visited.insert(container_id.to_string());

        let mut stack = Vec::new();
        for child in self.list_all(container_id).await? {
            stack.push((child, base_path.to_string()));
        }

        while let Some((item, parent_path)) = stack.pop() {
            let path = join_source_path(&parent_path, &item.name);
            if !item.is_container {
                out.items.push(WalkedItem { item, path });
                continue;
            }
            if !visited.insert(item.id.clone()) {
                debug!(container_id = item.id.as_str(), "container already visited");
                continue;
            }
            match self.list_all(&item.id).await {
                Ok(children) => {
                    for child in children {
                        stack.push((child, path.clone()));
                    }
                }
                Err(err) => {
                    warn!(
                        container_id = item.id.as_str(),
                        path = path.as_str(),
                        error = %err,
                        "skipping container that failed to list"
                    );
                    out.skipped_containers.push(item.id);
                }
            }
        }

        debug!(
            container_id,
            items = out.items.len(),
            skipped = out.skipped_containers.len(),
            "container walked"
        );
        Ok(out)
    }

    /// Drains every page of one container listing.
    async fn list_all(&self, container_id: &str) -> Result<Vec<ItemMetadata>, ConnectorError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        loop {
            let page = self
                .source
                .list_children(container_id, token.as_deref())
                .await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) if !seen_tokens.insert(next.clone()) => {
                    return Err(ConnectorError::Backend(format!(
                        "page token {next} repeated while listing {container_id}"
                    )));
                }
                Some(next) => token = Some(next),
                None => return Ok(items),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::{FAKE_ROOT_ID, FakeSource};
    use driveback_core::ChildPage;

    fn tree() -> Arc<FakeSource> {
        let source = Arc::new(FakeSource::new());
        source.add_folder("f", "F", FAKE_ROOT_ID);
        source.add_file("a", "a.txt", "f", 1);
        source.add_file("b", "b.txt", "f", 2);
        source.add_file("c", "c.txt", "f", 3);
        source.add_folder("g", "G", "f");
        source.add_file("d", "d.txt", "g", 4);
        source.add_folder("h", "H", "f");
        source.add_file("e", "e.txt", "h", 5);
        source
    }

    fn sorted_paths(walk: &TreeWalk) -> Vec<String> {
        let mut paths: Vec<String> = walk.items.iter().map(|entry| entry.path.clone()).collect();
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn drains_pages_and_returns_only_leaves() {
        let walker = TreeWalker::new(tree());
        let walk = walker.list_recursive("f").await.unwrap();
        assert_eq!(
            sorted_paths(&walk),
            vec!["F/G/d.txt", "F/H/e.txt", "F/a.txt", "F/b.txt", "F/c.txt"]
        );
        assert!(walk.skipped_containers.is_empty());
        assert!(walk.items.iter().all(|entry| !entry.item.is_container));
    }

    #[tokio::test]
    async fn failing_sub_container_is_skipped() {
        let source = tree();
        source.break_container("g");
        let walker = TreeWalker::new(source);
        let walk = walker.walk("f", "My Drive/F").await.unwrap();
        assert_eq!(walk.skipped_containers, vec!["g".to_string()]);
        assert_eq!(
            sorted_paths(&walk),
            vec![
                "My Drive/F/H/e.txt",
                "My Drive/F/a.txt",
                "My Drive/F/b.txt",
                "My Drive/F/c.txt"
            ]
        );
    }

    /// Serves the same one-item page forever, alternating two page tokens.
    struct CyclingTokens;

    #[async_trait::async_trait]
    impl SourceConnector for CyclingTokens {
        async fn get_metadata(&self, item_id: &str) -> Result<ItemMetadata, ConnectorError> {
            Err(ConnectorError::NotFound(item_id.to_string()))
        }

        async fn download(
            &self,
            item_id: &str,
            _dest_dir: &std::path::Path,
        ) -> Result<std::path::PathBuf, ConnectorError> {
            Err(ConnectorError::NotFound(item_id.to_string()))
        }

        async fn list_children(
            &self,
            _container_id: &str,
            page_token: Option<&str>,
        ) -> Result<ChildPage, ConnectorError> {
            let next = if page_token == Some("a") { "b" } else { "a" };
            Ok(ChildPage {
                items: vec![ItemMetadata {
                    id: format!("item-{next}"),
                    name: "x.txt".into(),
                    size: 1,
                    modified: None,
                    parent_ids: vec!["loop".into()],
                    is_container: false,
                }],
                next_page_token: Some(next.to_string()),
            })
        }
    }

    #[tokio::test]
    async fn cycling_page_tokens_are_an_error() {
        let walker = TreeWalker::new(Arc::new(CyclingTokens));
        let err = walker.walk("loop", "My Drive/Loop").await.unwrap_err();
        assert!(err.to_string().contains("repeated"));
    }

    #[tokio::test]
    async fn failing_root_is_an_error() {
        let source = tree();
        source.break_container("f");
        let walker = TreeWalker::new(source);
        assert!(walker.list_recursive("f").await.is_err());
    }
}
