//! # Eviction Policy
//!
//! Least-recently-used removal of blobs that no snapshot references.
//! Referenced blobs are never candidates; blobs whose content lock is held
//! are skipped rather than waited on.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::index::MetadataStore;
use crate::error::{CacheError, CacheResult};

/// What one eviction pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub requested_bytes: u64,
    pub freed_bytes: u64,
    /// Content ids removed, in removal order
    pub removed: Vec<String>,
}

impl EvictionReport {
    pub fn is_satisfied(&self) -> bool {
        self.freed_bytes >= self.requested_bytes
    }
}

#[derive(Debug, Clone)]
pub struct Evictor {
    store: Arc<MetadataStore>,
}

impl Evictor {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self { store }
    }

    /// Remove unreferenced blobs, oldest access first, until `target_bytes`
    /// are freed or no candidates remain.
    pub async fn run(&self, target_bytes: u64) -> CacheResult<EvictionReport> {
        let mut report = EvictionReport {
            requested_bytes: target_bytes,
            ..EvictionReport::default()
        };
        if target_bytes == 0 {
            return Ok(report);
        }

        for (content_id, size) in self.store.eviction_candidates() {
            if report.is_satisfied() {
                break;
            }
            // The store re-checks the reference count under the content lock
            match self.store.try_remove_unreferenced(&content_id).await? {
                Some(freed) => {
                    debug!(content_id = %content_id, size, "Evicted blob");
                    report.freed_bytes += freed;
                    report.removed.push(content_id);
                }
                None => debug!(content_id = %content_id, "Skipped eviction candidate"),
            }
        }

        info!(
            requested = report.requested_bytes,
            freed = report.freed_bytes,
            removed = report.removed.len(),
            "Eviction pass finished"
        );
        Ok(report)
    }

    /// Like [`run`](Self::run), but a shortfall is an error
    pub async fn evict(&self, target_bytes: u64) -> CacheResult<u64> {
        let report = self.run(target_bytes).await?;
        if !report.is_satisfied() {
            return Err(CacheError::BudgetExceeded {
                requested: report.requested_bytes,
                freed: report.freed_bytes,
            });
        }
        Ok(report.freed_bytes)
    }

    /// Bring the total size under `max_size_bytes`; a shortfall is only
    /// logged so the caller's publish still succeeds
    pub async fn enforce_budget(&self, max_size_bytes: u64) -> CacheResult<EvictionReport> {
        let total = self.store.total_size();
        if total <= max_size_bytes {
            return Ok(EvictionReport::default());
        }

        let report = self.run(total - max_size_bytes).await?;
        if !report.is_satisfied() {
            warn!(
                total_size = self.store.total_size(),
                max_size = max_size_bytes,
                freed = report.freed_bytes,
                "Cache is over budget and the remaining blobs are referenced"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layout::CacheLayout;
    use crate::cache::lock::{LockKey, LockManager};
    use crate::cache::types::BlobSource;
    use crate::repo::FileRef;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (Arc<MetadataStore>, Evictor) {
        let layout = CacheLayout::new(dir.path());
        let locks = Arc::new(LockManager::new(
            layout.clone(),
            Some(Duration::from_secs(5)),
            Duration::from_millis(10),
        ));
        let store = Arc::new(MetadataStore::open(layout, locks).await.unwrap());
        (Arc::clone(&store), Evictor::new(store))
    }

    // Publish `content` under `file` and return its id
    async fn put(store: &MetadataStore, file: &FileRef, content: &[u8]) -> String {
        let id = hex::encode(Sha256::digest(content));
        let temp = store.layout().temp_path(&id);
        tokio::fs::write(&temp, content).await.unwrap();
        store.publish(file, &id, BlobSource::Temp(temp)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn evicts_least_recently_used_first() {
        let dir = TempDir::new().unwrap();
        let (store, evictor) = setup(&dir).await;

        let a = FileRef::model("gpt2", "main", "a.bin");
        let b = FileRef::model("gpt2", "main", "b.bin");
        let c = FileRef::model("gpt2", "main", "c.bin");
        let id_a = put(&store, &a, &[1u8; 100]).await;
        let id_b = put(&store, &b, &[2u8; 100]).await;
        let id_c = put(&store, &c, &[3u8; 100]).await;

        // A is touched last, so B is the oldest
        store.record_access(&id_a);
        for file in [&a, &b, &c] {
            store.unlink(file).await.unwrap();
        }

        let report = evictor.run(100).await.unwrap();
        assert_eq!(report.removed, vec![id_b.clone()]);
        assert!(store.entry(&id_b).is_none());
        assert!(store.entry(&id_a).is_some());
        assert!(store.entry(&id_c).is_some());

        let report = evictor.run(150).await.unwrap();
        assert_eq!(report.removed, vec![id_c, id_a]);
        assert_eq!(store.total_size(), 0);
    }

    #[tokio::test]
    async fn referenced_blobs_are_protected() {
        let dir = TempDir::new().unwrap();
        let (store, evictor) = setup(&dir).await;

        let kept = FileRef::model("gpt2", "main", "kept.bin");
        let dropped = FileRef::model("gpt2", "main", "dropped.bin");
        let id_kept = put(&store, &kept, &[7u8; 64]).await;
        put(&store, &dropped, &[8u8; 32]).await;
        store.unlink(&dropped).await.unwrap();

        let err = evictor.evict(1000).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::BudgetExceeded {
                requested: 1000,
                freed: 32
            }
        ));
        assert!(store.lookup(&kept).await.unwrap().is_some());
        assert_eq!(store.entry(&id_kept).unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn busy_blobs_are_skipped() {
        let dir = TempDir::new().unwrap();
        let (store, evictor) = setup(&dir).await;

        let file = FileRef::model("gpt2", "main", "busy.bin");
        let id = put(&store, &file, b"in use").await;
        store.unlink(&file).await.unwrap();

        let guard = store
            .locks()
            .acquire(&LockKey::Content(id.clone()))
            .await
            .unwrap();
        let report = evictor.run(6).await.unwrap();
        assert!(report.removed.is_empty());

        drop(guard);
        assert_eq!(evictor.evict(6).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn budget_enforcement_tolerates_shortfall() {
        let dir = TempDir::new().unwrap();
        let (store, evictor) = setup(&dir).await;

        let file = FileRef::model("gpt2", "main", "big.bin");
        put(&store, &file, &[0u8; 500]).await;

        let report = evictor.enforce_budget(100).await.unwrap();
        assert_eq!(report.requested_bytes, 400);
        assert_eq!(report.freed_bytes, 0);
        assert_eq!(store.total_size(), 500);

        let report = evictor.enforce_budget(1000).await.unwrap();
        assert_eq!(report, EvictionReport::default());
    }
}
