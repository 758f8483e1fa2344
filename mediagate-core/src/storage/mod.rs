//! Key-value storage for live HLS segments and init sections.
//!
//! The storage layer knows nothing about playlists or segment lifetimes;
//! the HLS segmenter decides what to write and when to delete.

pub mod file;
pub mod memory;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::{HlsStorageBackend, HlsStorageConfig},
    error::Result,
};

pub use file::FileStorage;
pub use memory::MemoryStorage;

#[async_trait]
pub trait SegmentStorage: Send + Sync {
    async fn write(&self, key: &str, data: Bytes) -> Result<()>;

    /// `NotFound` for an unknown key.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drops everything written more than `older_than` ago, returning how
    /// many keys went. Catches segments orphaned by a crashed segmenter.
    async fn cleanup(&self, _older_than: Duration) -> Result<usize> {
        Ok(0)
    }
}

/// Builds the configured backend.
#[must_use]
pub fn from_config(config: &HlsStorageConfig) -> Arc<dyn SegmentStorage> {
    match config.backend {
        HlsStorageBackend::Memory => Arc::new(MemoryStorage::with_limit(config.max_bytes)),
        HlsStorageBackend::File => Arc::new(FileStorage::new(&config.path)),
    }
}
