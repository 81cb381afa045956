//! Backing stores for the result cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;

use crate::protocol::Message;

/// A stored response sequence together with the input it was produced for.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Trimmed input text; compared on read to reject derived-key collisions.
    pub original_key: String,
    pub sequence: Vec<Message>,
}

/// Key-value storage keyed by derived key.
///
/// Implementations may be remote. Errors inside a store are the store's
/// concern; a failed read is reported as a miss and a failed write is dropped.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<CacheEntry>;

    async fn set(&self, key: &str, entry: CacheEntry);

    async fn len(&self) -> usize;
}

/// In-process store bounded by entry count, evicting least recently used.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryStore {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.entries().cap().get()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries().get(key).cloned()
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        self.entries().put(key.to_string(), entry);
    }

    async fn len(&self) -> usize {
        self.entries().len()
    }
}
