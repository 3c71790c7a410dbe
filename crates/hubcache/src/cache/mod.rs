//! # Cache
//!
//! The on-disk, content-addressed store: path layout, locking, the metadata
//! index and LRU eviction.

pub mod eviction;
pub mod index;
pub mod layout;
pub mod lock;
pub mod scan;
pub mod types;

pub use eviction::{EvictionReport, Evictor};
pub use index::MetadataStore;
pub use layout::CacheLayout;
pub use lock::{LockGuard, LockKey, LockManager};
pub use types::{BlobSource, CacheEntry, CacheStats, PublishOutcome, RepoStats};
