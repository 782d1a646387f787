use std::path::{Path, PathBuf};

use rand::Rng;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("failed to create scratch directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Private download directory for one item sync. Removed by [`ScratchDir::remove`]
/// or, failing that, when dropped.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    removed: bool,
}

impl ScratchDir {
    pub async fn create(root: &Path) -> Result<Self, ScratchError> {
        let suffix: u64 = rand::thread_rng().r#gen();
        let path = root.join(format!("job-{suffix:016x}"));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| ScratchError::Create {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
