use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::SegmentStorage;
use crate::error::{GatewayError, Result};

const DEFAULT_MAX_BYTES: usize = 512 * 1024 * 1024;

struct Entry {
    data: Bytes,
    order: u64,
    written: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// write order -> key, oldest first
    by_age: BTreeMap<u64, String>,
    total_bytes: usize,
    next_order: u64,
}

impl Inner {
    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.total_bytes -= entry.data.len();
        self.by_age.remove(&entry.order);
        true
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.by_age.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes -= entry.data.len();
        }
        true
    }
}

/// Bounded in-process store; the oldest entries are evicted once the byte
/// budget is exceeded.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    /// `0` selects the default budget.
    #[must_use]
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes: if max_bytes == 0 { DEFAULT_MAX_BYTES } else { max_bytes },
        }
    }

    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().total_bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SegmentStorage for MemoryStorage {
    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        if data.len() > self.max_bytes {
            return Err(GatewayError::Storage(format!(
                "{key} is {} bytes, over the {} byte budget",
                data.len(),
                self.max_bytes
            )));
        }
        let mut inner = self.inner.lock();
        inner.remove(key);
        let mut evicted = 0;
        while inner.total_bytes + data.len() > self.max_bytes && inner.evict_oldest() {
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, bytes = inner.total_bytes, "Evicted segments from memory storage");
        }
        let order = inner.next_order;
        inner.next_order += 1;
        inner.total_bytes += data.len();
        inner.by_age.insert(order, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                data,
                order,
                written: Instant::now(),
            },
        );
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.inner
            .lock()
            .entries
            .get(key)
            .map(|e| e.data.clone())
            .ok_or_else(|| GatewayError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().entries.contains_key(key))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<usize> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.written.elapsed() >= older_than)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        Ok(expired.len())
    }
}
