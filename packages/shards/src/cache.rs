//! Local artifact cache keyed by URL.
//!
//! Entries live at `<root>/<host>/<url path>`. Writes go to a temporary
//! file in the same directory and are renamed into place, so a reader never
//! observes a partially written entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::trace;
use url::Url;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The per-user cache directory, if the platform has one.
    pub fn default_location() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("sandlink"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the entry for `url` is stored.
    pub fn path_for(&self, url: &Url) -> PathBuf {
        let mut path = self.root.clone();
        path.push(match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}_{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => "local".to_string(),
        });
        for segment in url.path_segments().into_iter().flatten() {
            if !segment.is_empty() && segment != "." && segment != ".." {
                path.push(segment);
            }
        }
        path
    }

    pub async fn contains(&self, url: &Url) -> bool {
        fs::metadata(self.path_for(url))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub async fn get(&self, url: &Url) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(url)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, url: &Url, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(url);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).await?;
        let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&temp, bytes).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        trace!(url = %url, bytes = bytes.len(), "cached artifact");
        Ok(())
    }

    /// Remove an entry; returns whether it existed.
    pub async fn delete(&self, url: &Url) -> Result<bool> {
        match fs::remove_file(self.path_for(url)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
