//! Result cache subsystem.
//!
//! # Data Flow
//! ```text
//! request code
//!     → cache_key (trim + SHA-256)
//!     → CacheStore::get → verify stored original input
//!     → hit: replay sequence | miss: claim flight → execute → insert_if_absent
//! ```
//!
//! # Design Decisions
//! - Entries carry the original input; a mismatch on read is a miss, never an error
//! - The in-memory store is bounded and evicts least recently used entries
//! - Concurrent misses for one key are collapsed with a single-flight claim

pub mod flight;
pub mod result_cache;
pub mod store;

pub use flight::{Flight, FlightGuard, FlightWait};
pub use result_cache::{cache_key, ResultCache};
pub use store::{CacheEntry, CacheStore, MemoryStore};
