//! Result cache with collision-verified lookups.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cache::flight::{Flight, FlightTable};
use crate::cache::store::{CacheEntry, CacheStore, MemoryStore};
use crate::observability::metrics;
use crate::protocol::Message;

/// Derived key for `input`: SHA-256 hex of the trimmed text.
pub fn cache_key(input: &str) -> String {
    let digest = Sha256::digest(input.trim().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Maps request input to the response sequence it produced.
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    // Serializes read-compare-write so first-writer-wins holds.
    write_gate: tokio::sync::Mutex<()>,
    flights: FlightTable,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            write_gate: tokio::sync::Mutex::new(()),
            flights: FlightTable::default(),
        }
    }

    /// Cache backed by a bounded [`MemoryStore`].
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemoryStore::new(capacity)))
    }

    async fn lookup(&self, input: &str) -> Option<Vec<Message>> {
        let input = input.trim();
        match self.store.get(&cache_key(input)).await {
            Some(entry) if entry.original_key == input => Some(entry.sequence),
            Some(_) => {
                tracing::debug!("Derived cache key collided with a different input");
                None
            }
            None => None,
        }
    }

    /// Stored sequence for `input`, or `None` on a miss or a key collision.
    pub async fn get(&self, input: &str) -> Option<Vec<Message>> {
        let hit = self.lookup(input).await;
        metrics::record_cache_lookup(hit.is_some());
        hit
    }

    /// Store `sequence` under `input`, replacing whatever the derived key held.
    pub async fn set(&self, input: &str, sequence: Vec<Message>) {
        let _gate = self.write_gate.lock().await;
        self.write(input, sequence).await;
    }

    /// Store `sequence` unless a verified entry for `input` already exists.
    /// Returns true if this call wrote.
    pub async fn insert_if_absent(&self, input: &str, sequence: Vec<Message>) -> bool {
        let _gate = self.write_gate.lock().await;
        if self.lookup(input).await.is_some() {
            return false;
        }
        self.write(input, sequence).await;
        true
    }

    async fn write(&self, input: &str, sequence: Vec<Message>) {
        let input = input.trim();
        let entry = CacheEntry {
            original_key: input.to_string(),
            sequence,
        };
        self.store.set(&cache_key(input), entry).await;
    }

    /// Claim the right to resolve a miss for `input`.
    pub fn claim(&self, input: &str) -> Flight {
        self.flights.claim(&cache_key(input))
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
