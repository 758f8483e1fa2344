use std::{
    io::ErrorKind,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, trace};

use super::SegmentStorage;
use crate::error::{GatewayError, Result};

/// Keys become sha256 file names, so a key can never escape `base_path`.
fn hashed(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn is_hashed_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Flat directory of hashed files.
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.base_path.join(hashed(key))
    }
}

#[async_trait]
impl SegmentStorage for FileStorage {
    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| GatewayError::storage(format!("create {}: {e}", self.base_path.display())))?;
        let path = self.path(key);
        let size = data.len();
        fs::write(&path, data)
            .await
            .map_err(|e| GatewayError::storage(format!("write {key}: {e}")))?;
        trace!(key, size, "Stored segment");
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        match fs::read(self.path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(GatewayError::NotFound(key.to_string())),
            Err(e) => Err(GatewayError::storage(format!("read {key}: {e}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(GatewayError::storage(format!("delete {key}: {e}"))),
            _ => Ok(()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        fs::try_exists(self.path(key)).await.map_err(GatewayError::storage)
    }

    async fn cleanup(&self, older_than: Duration) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(GatewayError::storage(e)),
        };
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;
        while let Some(entry) = entries.next_entry().await.map_err(GatewayError::storage)? {
            // leave anything we did not write alone
            if !is_hashed_name(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_file()
                && meta.modified().is_ok_and(|modified| modified < cutoff)
                && fs::remove_file(entry.path()).await.is_ok()
            {
                deleted += 1;
            }
        }
        if deleted > 0 {
            debug!(deleted, path = %self.base_path.display(), "Removed expired segment files");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("hls"));

        storage.write("live/cam1/3.ts", Bytes::from_static(b"seg")).await.unwrap();
        assert_eq!(&storage.read("live/cam1/3.ts").await.unwrap()[..], b"seg");
        assert!(storage.exists("live/cam1/3.ts").await.unwrap());

        storage.delete("live/cam1/3.ts").await.unwrap();
        storage.delete("live/cam1/3.ts").await.unwrap();
        assert!(matches!(
            storage.read("live/cam1/3.ts").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_only_touches_hashed_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write("a", Bytes::from_static(b"1")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        storage.write("b", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(storage.cleanup(Duration::from_millis(25)).await.unwrap(), 1);
        assert!(!storage.exists("a").await.unwrap());
        assert!(storage.exists("b").await.unwrap());
        assert!(dir.path().join("notes.txt").exists());
    }
}
