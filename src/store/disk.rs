//! Local-disk snapshots used when the configuration source is unreachable

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding one `<store>.json` snapshot per store
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    /// Use `dir` for snapshots. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshot path for a store
    pub fn path_for(&self, store: &str) -> PathBuf {
        let safe: String = store
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    /// Write a snapshot atomically (temp file + rename)
    pub async fn save<T: Serialize>(&self, store: &str, value: &T) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(store);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(store, path = %path.display(), bytes = bytes.len(), "Saved store snapshot");
        Ok(())
    }

    /// Load a snapshot. Missing or unreadable snapshots yield `None`.
    pub async fn load<T: DeserializeOwned>(&self, store: &str) -> Option<T> {
        let path = self.path_for(store);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(store, path = %path.display(), error = %e, "Failed to read store snapshot");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(store, path = %path.display(), error = %e, "Corrupt store snapshot");
                None
            }
        }
    }

    /// Snapshot directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
