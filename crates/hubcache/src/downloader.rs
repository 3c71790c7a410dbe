//! # Hub cache
//!
//! [`HubCache`] is the entry point for API clients: it owns the metadata
//! store, the download engine and the eviction policy for one cache root.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info};

use crate::cache::index::run_blocking;
use crate::cache::layout::CacheLayout;
use crate::cache::lock::{LockKey, LockManager};
use crate::cache::scan;
use crate::cache::{CacheStats, MetadataStore};
use crate::config::{CacheConfig, HttpConfig};
use crate::download::{DownloadEngine, OnEvent};
use crate::error::CacheResult;
use crate::remote::{HttpRemote, HubRemote};
use crate::repo::{FileRef, RepoKind};

pub struct HubCache<R: HubRemote = HttpRemote> {
    engine: DownloadEngine<R>,
    store: Arc<MetadataStore>,
    config: CacheConfig,
}

impl HubCache<HttpRemote> {
    /// Open a cache backed by the HTTP hub collaborator
    pub async fn with_http(config: CacheConfig, http: HttpConfig) -> CacheResult<Self> {
        let remote = HttpRemote::new(http)?;
        Self::open(config, Arc::new(remote)).await
    }
}

impl<R: HubRemote> HubCache<R> {
    /// Open the cache rooted at `config.cache_dir`, creating it if needed and
    /// indexing whatever it already holds
    pub async fn open(config: CacheConfig, remote: Arc<R>) -> CacheResult<Self> {
        let layout = CacheLayout::new(&config.cache_dir);
        let locks = Arc::new(LockManager::new(
            layout.clone(),
            config.lock_timeout,
            config.lock_poll_interval,
        ));
        let store = Arc::new(MetadataStore::open(layout, locks).await?);
        let engine = DownloadEngine::new(remote, Arc::clone(&store), config.clone());

        info!(root = ?config.cache_dir, max_size = ?config.max_size_bytes, "Opened hub cache");
        Ok(Self {
            engine,
            store,
            config,
        })
    }

    /// Receive download progress events
    pub fn with_event_handler(self, handler: OnEvent) -> Self {
        Self {
            engine: self.engine.with_event_handler(handler),
            ..self
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn remote(&self) -> &Arc<R> {
        self.engine.remote()
    }

    /// Make `file` present locally and return the path of its bytes
    pub async fn ensure_present(&self, file: &FileRef) -> CacheResult<PathBuf> {
        self.engine.ensure_present(file).await
    }

    pub async fn is_cached(&self, file: &FileRef) -> CacheResult<bool> {
        Ok(self.cache_path(file).await?.is_some())
    }

    /// Path of the cached bytes of `file`, without touching the network
    pub async fn cache_path(&self, file: &FileRef) -> CacheResult<Option<PathBuf>> {
        let path = self.store.lookup(file).await?;
        if path.is_some() {
            if let Some(content_id) = self.store.content_id_of(file) {
                self.store.record_access(&content_id);
            }
        }
        Ok(path)
    }

    /// Where the snapshot link for `file` lives, whether or not it exists
    pub fn snapshot_path(&self, file: &FileRef) -> CacheResult<PathBuf> {
        self.store.layout().snapshot_path(file)
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        self.store.stats().await
    }

    /// Remove cached references, optionally only those of one repository
    /// and/or kind; returns how many were removed
    pub async fn clear(&self, repo_id: Option<&str>, kind: Option<RepoKind>) -> CacheResult<usize> {
        self.store.clear(repo_id, kind).await
    }

    /// Free at least `target_bytes` from unreferenced content
    pub async fn evict(&self, target_bytes: u64) -> CacheResult<u64> {
        self.engine.evictor().evict(target_bytes).await
    }

    /// Forget `file` while keeping its content until eviction
    pub async fn unlink(&self, file: &FileRef) -> CacheResult<bool> {
        self.store.unlink(file).await
    }

    /// Delete partial downloads nobody is working on, then the lock files
    /// no one holds. Returns the number of partials removed.
    pub async fn prune_partials(&self) -> CacheResult<usize> {
        let layout = self.store.layout().clone();
        let keys = {
            let layout = layout.clone();
            run_blocking(move || scan::list_partials(&layout)).await?
        };

        let mut removed = 0;
        for key in keys {
            let Some(_lock) = self
                .store
                .locks()
                .try_acquire(&LockKey::Download(key.clone()))?
            else {
                debug!(key = %key, "Partial download in progress, keeping it");
                continue;
            };
            remove_if_exists(layout.temp_path(&key)).await?;
            remove_if_exists(layout.meta_path(&key)).await?;
            removed += 1;
        }

        let names = {
            let layout = layout.clone();
            run_blocking(move || scan::list_lock_names(&layout)).await?
        };
        let mut lock_files = 0;
        for key in names.iter().filter_map(|name| LockKey::from_name(name)) {
            if self.store.locks().remove_lock_file(&key)? {
                lock_files += 1;
            }
        }

        info!(removed, lock_files, "Pruned partial downloads");
        Ok(removed)
    }

    /// Rescan the cache root; returns the number of cached blobs
    pub async fn rebuild_index(&self) -> CacheResult<usize> {
        self.store.rebuild().await
    }
}

async fn remove_if_exists(path: PathBuf) -> io::Result<()> {
    match fs::remove_file(&path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
