//! # Cache Metadata Store
//!
//! The single authority over the in-memory index of blobs and snapshot
//! references. Every mutation goes through a short critical section on one
//! mutex; filesystem work happens before or after it, never inside.
//!
//! The index is never persisted. It is rebuilt from disk at startup and on
//! demand, and a miss re-validates the disk in case another process published
//! the file in the meantime.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::cache::layout::CacheLayout;
use crate::cache::lock::{LockKey, LockManager};
use crate::cache::scan::{self, ScanResult, TEMP_LINK_PREFIX};
use crate::cache::types::{BlobSource, CacheEntry, CacheStats, PublishOutcome, RepoStats};
use crate::error::{CacheError, CacheResult};
use crate::repo::{FileRef, RepoKind};

static TEMP_LINK_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    refs: HashMap<FileRef, String>,
    total_size_bytes: u64,
    clock: u64,
}

impl CacheIndex {
    fn from_scan(scan: ScanResult) -> Self {
        let mut index = Self::default();

        let mut latest: HashMap<&str, SystemTime> = scan
            .blobs
            .iter()
            .map(|blob| (blob.content_id.as_str(), blob.modified))
            .collect();
        for scanned in &scan.refs {
            if let Some(at) = latest.get_mut(scanned.content_id.as_str()) {
                *at = (*at).max(scanned.modified);
            }
        }

        // Seed access ticks from modification order so LRU survives a restart
        let mut blobs: Vec<_> = scan.blobs.iter().collect();
        blobs.sort_by_key(|blob| (latest[blob.content_id.as_str()], blob.content_id.clone()));
        for blob in blobs {
            let tick = index.tick();
            index.total_size_bytes += blob.size_bytes;
            index.entries.insert(
                blob.content_id.clone(),
                CacheEntry {
                    content_id: blob.content_id.clone(),
                    size_bytes: blob.size_bytes,
                    blob_path: blob.path.clone(),
                    last_access: tick,
                    last_accessed_at: latest[blob.content_id.as_str()],
                    ref_count: 0,
                },
            );
        }

        for scanned in scan.refs {
            index.set_ref(scanned.file, &scanned.content_id);
        }
        index
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, content_id: &str) {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(content_id) {
            entry.last_access = tick;
            entry.last_accessed_at = SystemTime::now();
        }
    }

    /// Returns whether the entry was new to the index
    fn insert_entry(&mut self, content_id: &str, size_bytes: u64, blob_path: PathBuf) -> bool {
        if let Some(entry) = self.entries.get_mut(content_id) {
            if entry.size_bytes != size_bytes {
                self.total_size_bytes = self.total_size_bytes - entry.size_bytes + size_bytes;
                entry.size_bytes = size_bytes;
            }
            return false;
        }
        self.total_size_bytes += size_bytes;
        self.entries.insert(
            content_id.to_owned(),
            CacheEntry {
                content_id: content_id.to_owned(),
                size_bytes,
                blob_path,
                last_access: 0,
                last_accessed_at: SystemTime::now(),
                ref_count: 0,
            },
        );
        true
    }

    /// Point `file` at `content_id`, returning the previous target
    fn set_ref(&mut self, file: FileRef, content_id: &str) -> Option<String> {
        if !self.entries.contains_key(content_id) {
            return None;
        }
        let previous = self.refs.insert(file, content_id.to_owned());
        if previous.as_deref() == Some(content_id) {
            return previous;
        }
        if let Some(old) = previous.as_deref() {
            if let Some(entry) = self.entries.get_mut(old) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
        if let Some(entry) = self.entries.get_mut(content_id) {
            entry.ref_count += 1;
        }
        previous
    }

    fn drop_ref(&mut self, file: &FileRef) -> Option<String> {
        let content_id = self.refs.remove(file)?;
        if let Some(entry) = self.entries.get_mut(&content_id) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
        Some(content_id)
    }

    /// Remove an entry together with every reference to it
    fn remove_entry(&mut self, content_id: &str) -> Option<(CacheEntry, Vec<FileRef>)> {
        let entry = self.entries.remove(content_id)?;
        self.total_size_bytes = self.total_size_bytes.saturating_sub(entry.size_bytes);
        let refs: Vec<FileRef> = self
            .refs
            .iter()
            .filter(|(_, id)| id.as_str() == content_id)
            .map(|(file, _)| file.clone())
            .collect();
        for file in &refs {
            self.refs.remove(file);
        }
        Some((entry, refs))
    }

    fn resolve(&self, file: &FileRef) -> Option<&CacheEntry> {
        self.refs.get(file).and_then(|id| self.entries.get(id))
    }
}

#[derive(Debug)]
pub struct MetadataStore {
    layout: CacheLayout,
    locks: Arc<LockManager>,
    index: Mutex<CacheIndex>,
}

impl MetadataStore {
    /// Create the layout directories and build the index from disk
    pub async fn open(layout: CacheLayout, locks: Arc<LockManager>) -> CacheResult<Self> {
        layout.ensure_dirs().await?;
        let store = Self {
            layout,
            locks,
            index: Mutex::new(CacheIndex::default()),
        };
        store.rebuild().await?;
        Ok(store)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Rescan the cache root and replace the index; returns the entry count
    pub async fn rebuild(&self) -> CacheResult<usize> {
        let layout = self.layout.clone();
        let scanned = run_blocking(move || scan::scan_cache(&layout)).await?;
        let removed_links = scanned.removed_links;
        let rebuilt = CacheIndex::from_scan(scanned);
        let entry_count = rebuilt.entries.len();

        info!(
            root = ?self.layout.root(),
            entries = entry_count,
            refs = rebuilt.refs.len(),
            total_size = rebuilt.total_size_bytes,
            removed_links,
            "Rebuilt cache index"
        );
        *self.index.lock() = rebuilt;
        Ok(entry_count)
    }

    /// Blob path for `file` if it is cached and intact.
    ///
    /// A recorded blob that vanished or changed size is dropped from the index
    /// and reported as a miss, as is a reference whose snapshot link is gone. A file unknown to the index is looked up on
    /// disk and adopted when a valid snapshot link exists.
    pub async fn lookup(&self, file: &FileRef) -> CacheResult<Option<PathBuf>> {
        file.validate()?;
        let indexed = {
            let index = self.index.lock();
            index
                .resolve(file)
                .map(|entry| (entry.content_id.clone(), entry.blob_path.clone(), entry.size_bytes))
        };

        let Some((content_id, blob_path, size)) = indexed else {
            return self.adopt_from_disk(file).await;
        };

        let link = self.layout.snapshot_path(file)?;
        if fs::symlink_metadata(&link).await.is_err() {
            debug!(file = %file, content_id = %content_id, "Snapshot link removed externally, dropping reference");
            self.index.lock().drop_ref(file);
            return Ok(None);
        }

        match fs::metadata(&blob_path).await {
            Ok(meta) if meta.is_file() && meta.len() == size => Ok(Some(blob_path)),
            Ok(meta) => {
                warn!(
                    content_id = %content_id,
                    expected = size,
                    actual = meta.len(),
                    "Cached blob changed size, dropping it"
                );
                self.forget_blob(&content_id).await;
                if let Err(e) = fs::remove_file(&blob_path).await {
                    warn!(path = ?blob_path, error = %e, "Failed to remove damaged blob");
                }
                Ok(None)
            }
            Err(e) => {
                warn!(content_id = %content_id, error = %e, "Cached blob is missing, dropping entry");
                self.forget_blob(&content_id).await;
                Ok(None)
            }
        }
    }

    /// Bump the access tick of a blob; unknown ids are ignored
    pub fn record_access(&self, content_id: &str) {
        self.index.lock().touch(content_id);
    }

    /// Content id `file` currently resolves to in the index
    pub fn content_id_of(&self, file: &FileRef) -> Option<String> {
        self.index.lock().refs.get(file).cloned()
    }

    pub fn entry(&self, content_id: &str) -> Option<CacheEntry> {
        self.index.lock().entries.get(content_id).cloned()
    }

    /// Whether the blob for `content_id` exists on disk
    pub async fn has_blob(&self, content_id: &str) -> bool {
        match self.layout.blob_path(content_id) {
            Ok(path) => fs::metadata(path).await.is_ok_and(|meta| meta.is_file()),
            Err(_) => false,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.index.lock().total_size_bytes
    }

    /// Make `file` resolve to the blob `content_id`.
    ///
    /// Takes the content lock for the blob. A temp source is renamed into
    /// place unless an intact blob already exists, in which case the temp file
    /// is discarded; an existing blob of the wrong size is replaced. An `Existing` source fails with [`CacheError::NotFound`]
    /// when the blob is not on disk.
    pub async fn publish(
        &self,
        file: &FileRef,
        content_id: &str,
        source: BlobSource,
    ) -> CacheResult<PublishOutcome> {
        file.validate()?;
        let blob_path = self.layout.blob_path(content_id)?;
        let link_path = self.layout.snapshot_path(file)?;
        let _content = self
            .locks
            .acquire(&LockKey::Content(content_id.to_owned()))
            .await?;

        let existing = fs::metadata(&blob_path)
            .await
            .ok()
            .filter(|meta| meta.is_file());
        let new_blob = match (source, existing) {
            (BlobSource::Temp(temp), Some(existing)) => {
                let verified = fs::metadata(&temp).await?.len();
                if verified == existing.len() {
                    debug!(content_id = %content_id, "Blob already cached, discarding download");
                    remove_if_exists(&temp).await;
                } else {
                    warn!(
                        content_id = %content_id,
                        cached = existing.len(),
                        verified,
                        "Cached blob differs from verified download, replacing it"
                    );
                    fs::rename(&temp, &blob_path).await?;
                }
                false
            }
            (BlobSource::Temp(temp), None) => {
                if let Some(parent) = blob_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(&temp, &blob_path).await?;
                true
            }
            (BlobSource::Existing, Some(_)) => false,
            (BlobSource::Existing, None) => {
                return Err(CacheError::NotFound(format!("blob {content_id}")));
            }
        };
        let size_bytes = fs::metadata(&blob_path).await?.len();

        let linked = self.write_link(file, content_id, &blob_path, &link_path).await;

        {
            let mut index = self.index.lock();
            index.insert_entry(content_id, size_bytes, blob_path.clone());
            if linked.is_ok() {
                index.set_ref(file.clone(), content_id);
            }
            index.touch(content_id);
        }
        linked?;

        debug!(file = %file, content_id = %content_id, size = size_bytes, new_blob, "Published file");
        Ok(PublishOutcome {
            blob_path,
            new_blob,
        })
    }

    /// Delete a blob and every reference to it; returns the freed bytes
    pub async fn remove(&self, content_id: &str) -> CacheResult<u64> {
        let _content = self
            .locks
            .acquire(&LockKey::Content(content_id.to_owned()))
            .await?;
        match self.remove_locked(content_id, false).await? {
            Some(freed) => Ok(freed),
            None => Err(CacheError::NotFound(format!("blob {content_id}"))),
        }
    }

    /// Delete a blob only if it is unreferenced and its content lock is free.
    ///
    /// Returns `None` when the blob is busy, referenced or already gone.
    pub async fn try_remove_unreferenced(&self, content_id: &str) -> CacheResult<Option<u64>> {
        let Some(_content) = self
            .locks
            .try_acquire(&LockKey::Content(content_id.to_owned()))?
        else {
            debug!(content_id = %content_id, "Blob is busy, skipping removal");
            return Ok(None);
        };
        match self.remove_locked(content_id, true).await {
            Err(CacheError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    // Caller holds the content lock
    async fn remove_locked(
        &self,
        content_id: &str,
        require_unreferenced: bool,
    ) -> CacheResult<Option<u64>> {
        let (blob_path, referenced) = {
            let index = self.index.lock();
            let entry = index
                .entries
                .get(content_id)
                .ok_or_else(|| CacheError::NotFound(format!("blob {content_id}")))?;
            (entry.blob_path.clone(), entry.is_referenced())
        };
        if require_unreferenced && referenced {
            return Ok(None);
        }

        match fs::remove_file(&blob_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = ?blob_path, error = %e, "Failed to remove blob");
                return Err(e.into());
            }
        }

        let Some((entry, refs)) = self.index.lock().remove_entry(content_id) else {
            return Ok(None);
        };

        for file in &refs {
            if let Ok(link) = self.layout.snapshot_path(file) {
                remove_if_exists(&link).await;
                self.remove_empty_parents(&link).await;
            }
        }
        if let Some(shard) = blob_path.parent() {
            let _ = fs::remove_dir(shard).await;
        }

        debug!(
            content_id = %content_id,
            freed = entry.size_bytes,
            refs = refs.len(),
            "Removed blob"
        );
        Ok(Some(entry.size_bytes))
    }

    /// Drop the reference for `file`, keeping its blob.
    ///
    /// Returns whether a reference existed.
    pub async fn unlink(&self, file: &FileRef) -> CacheResult<bool> {
        let link = self.layout.snapshot_path(file)?;
        let on_disk = match fs::remove_file(&link).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        self.remove_empty_parents(&link).await;

        let dropped = self.index.lock().drop_ref(file);
        if let Some(content_id) = &dropped {
            debug!(file = %file, content_id = %content_id, "Unlinked snapshot");
        }
        Ok(on_disk || dropped.is_some())
    }

    /// Remove every reference matching the filters and the blobs that leaves
    /// unreferenced. Without filters, blobs that were already unreferenced
    /// are deleted too. Returns the number of references removed.
    pub async fn clear(&self, repo_id: Option<&str>, kind: Option<RepoKind>) -> CacheResult<usize> {
        let targets: Vec<(FileRef, String)> = {
            let index = self.index.lock();
            index
                .refs
                .iter()
                .filter(|(file, _)| {
                    repo_id.is_none_or(|repo| file.repo_id == repo)
                        && kind.is_none_or(|kind| file.kind == kind)
                })
                .map(|(file, id)| (file.clone(), id.clone()))
                .collect()
        };

        let mut removed = 0;
        let mut touched: HashSet<String> = HashSet::new();
        for (file, content_id) in targets {
            if self.unlink(&file).await? {
                removed += 1;
            }
            touched.insert(content_id);
        }

        if repo_id.is_none() && kind.is_none() {
            let index = self.index.lock();
            touched.extend(
                index
                    .entries
                    .values()
                    .filter(|entry| !entry.is_referenced())
                    .map(|entry| entry.content_id.clone()),
            );
        }

        let mut freed = 0;
        for content_id in touched {
            let _content = self
                .locks
                .acquire(&LockKey::Content(content_id.clone()))
                .await?;
            match self.remove_locked(&content_id, true).await {
                Ok(Some(bytes)) => freed += bytes,
                Ok(None) | Err(CacheError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            repo_id = repo_id.unwrap_or("*"),
            kind = kind.map(|k| k.as_str()).unwrap_or("*"),
            removed,
            freed,
            "Cleared cache references"
        );
        Ok(removed)
    }

    /// Unreferenced blobs, least recently used first
    pub fn eviction_candidates(&self) -> Vec<(String, u64)> {
        let index = self.index.lock();
        let mut candidates: Vec<&CacheEntry> = index
            .entries
            .values()
            .filter(|entry| !entry.is_referenced())
            .collect();
        candidates.sort_by_key(|entry| entry.last_access);
        candidates
            .into_iter()
            .map(|entry| (entry.content_id.clone(), entry.size_bytes))
            .collect()
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let layout = self.layout.clone();
        let partial_count = run_blocking(move || scan::count_partials(&layout)).await?;

        let index = self.index.lock();
        let mut groups: BTreeMap<(RepoKind, &str), (HashSet<&str>, usize, BTreeSet<String>)> =
            BTreeMap::new();
        for (file, content_id) in &index.refs {
            let group = groups
                .entry((file.kind, file.repo_id.as_str()))
                .or_default();
            group.0.insert(content_id.as_str());
            group.1 += 1;
            group.2.insert(file.revision.clone());
        }

        let repos: Vec<RepoStats> = groups
            .into_iter()
            .map(|((kind, repo_id), (blobs, nb_files, revisions))| {
                let entries = blobs.iter().filter_map(|id| index.entries.get(*id));
                let (size_on_disk, last_accessed_at) =
                    entries.fold((0, None), |(size, last), entry| {
                        (
                            size + entry.size_bytes,
                            last.max(Some(entry.last_accessed_at)),
                        )
                    });
                RepoStats {
                    kind,
                    repo_id: repo_id.to_owned(),
                    size_on_disk,
                    nb_files,
                    revisions,
                    last_accessed_at,
                }
            })
            .collect();

        Ok(CacheStats {
            total_size_bytes: index.total_size_bytes,
            entry_count: index.entries.len(),
            repo_ids: repos.iter().map(|repo| repo.repo_id.clone()).collect(),
            orphan_count: index
                .entries
                .values()
                .filter(|entry| !entry.is_referenced())
                .count(),
            partial_count,
            repos,
        })
    }

    // Drop an entry whose blob is gone, along with its links
    async fn forget_blob(&self, content_id: &str) {
        let removed = self.index.lock().remove_entry(content_id);
        if let Some((_, refs)) = removed {
            for file in refs {
                if let Ok(link) = self.layout.snapshot_path(&file) {
                    remove_if_exists(&link).await;
                }
            }
        }
    }

    async fn adopt_from_disk(&self, file: &FileRef) -> CacheResult<Option<PathBuf>> {
        let link = self.layout.snapshot_path(file)?;
        let Ok(link_meta) = fs::symlink_metadata(&link).await else {
            return Ok(None);
        };

        let content_id = if link_meta.file_type().is_symlink() {
            fs::read_link(&link)
                .await
                .ok()
                .and_then(|target| target.file_name().and_then(|n| n.to_str()).map(str::to_owned))
        } else {
            let copy = link.clone();
            run_blocking(move || scan::digest_file(&copy)).await.ok()
        };
        let Some(content_id) = content_id else {
            return Ok(None);
        };
        let Ok(blob_path) = self.layout.blob_path(&content_id) else {
            return Ok(None);
        };

        let size_bytes = match fs::metadata(&blob_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                if link_meta.file_type().is_symlink() {
                    debug!(path = ?link, "Removing dangling snapshot link");
                    remove_if_exists(&link).await;
                }
                return Ok(None);
            }
        };

        {
            let mut index = self.index.lock();
            index.insert_entry(&content_id, size_bytes, blob_path.clone());
            index.set_ref(file.clone(), &content_id);
        }
        debug!(file = %file, content_id = %content_id, "Adopted snapshot published elsewhere");
        Ok(Some(blob_path))
    }

    async fn write_link(
        &self,
        file: &FileRef,
        content_id: &str,
        blob_path: &Path,
        link_path: &Path,
    ) -> CacheResult<()> {
        let parent = link_path
            .parent()
            .ok_or_else(|| CacheError::Inconsistent(format!("no parent for {link_path:?}")))?;
        fs::create_dir_all(parent).await?;

        let temp_link = parent.join(format!(
            "{TEMP_LINK_PREFIX}{}-{}",
            std::process::id(),
            TEMP_LINK_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        remove_if_exists(&temp_link).await;

        let target = self.layout.link_target(file, content_id)?;
        if let Err(e) = symlink(&target, &temp_link).await {
            debug!(error = %e, "Symlink unavailable, copying blob into snapshot");
            fs::copy(blob_path, &temp_link).await?;
        }

        if let Err(e) = fs::rename(&temp_link, link_path).await {
            remove_if_exists(&temp_link).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove_empty_parents(&self, link: &Path) {
        let root = self.layout.snapshots_dir();
        let mut dir = link.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(&root) {
                break;
            }
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink_file(target, link).await
}

#[cfg(not(any(unix, windows)))]
async fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove file"),
    }
}

pub(crate) async fn run_blocking<T, F>(f: F) -> CacheResult<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
        .map_err(CacheError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> MetadataStore {
        let layout = CacheLayout::new(dir.path());
        let locks = Arc::new(LockManager::new(
            layout.clone(),
            Some(Duration::from_secs(5)),
            Duration::from_millis(10),
        ));
        MetadataStore::open(layout, locks).await.unwrap()
    }

    async fn stage(store: &MetadataStore, name: &str, content: &[u8]) -> (BlobSource, String) {
        let temp = store.layout().temp_path(name);
        fs::write(&temp, content).await.unwrap();
        (BlobSource::Temp(temp), hex::encode(Sha256::digest(content)))
    }

    #[tokio::test]
    async fn publish_then_lookup() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("org/name", "main", "config.json");

        assert_eq!(store.lookup(&file).await.unwrap(), None);

        let (source, id) = stage(&store, "a", b"{\"a\":1}").await;
        let outcome = store.publish(&file, &id, source).await.unwrap();
        assert!(outcome.new_blob);

        let path = store.lookup(&file).await.unwrap().unwrap();
        assert_eq!(path, outcome.blob_path);
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        assert_eq!(store.total_size(), 7);

        let snapshot = store.layout().snapshot_path(&file).unwrap();
        assert_eq!(std::fs::read(snapshot).unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let main = FileRef::model("org/name", "main", "weights.bin");
        let tag = FileRef::model("org/name", "v1.0", "weights.bin");

        let (source, id) = stage(&store, "a", b"same bytes").await;
        store.publish(&main, &id, source).await.unwrap();
        let outcome = store.publish(&tag, &id, BlobSource::Existing).await.unwrap();
        assert!(!outcome.new_blob);

        let (again, _) = stage(&store, "b", b"same bytes").await;
        let BlobSource::Temp(temp) = again.clone() else {
            unreachable!()
        };
        store.publish(&main, &id, again).await.unwrap();
        assert!(!temp.exists());

        assert_eq!(store.total_size(), 10);
        assert_eq!(store.entry(&id).unwrap().ref_count, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.repos.len(), 1);
        assert_eq!(stats.repos[0].nb_files, 2);
        assert_eq!(stats.repos[0].size_on_disk, 10);
        assert_eq!(stats.repos[0].revisions.len(), 2);
    }

    #[tokio::test]
    async fn existing_source_requires_blob() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "a.txt");
        let err = store
            .publish(&file, "deadbeef", BlobSource::Existing)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
        assert_eq!(store.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn repointing_a_ref_orphans_the_old_blob() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "model.bin");

        let (v1, old) = stage(&store, "a", b"version one").await;
        store.publish(&file, &old, v1).await.unwrap();
        let (v2, new) = stage(&store, "b", b"version two!").await;
        store.publish(&file, &new, v2).await.unwrap();

        assert_eq!(store.entry(&old).unwrap().ref_count, 0);
        assert_eq!(store.entry(&new).unwrap().ref_count, 1);
        assert_eq!(store.eviction_candidates(), vec![(old, 11)]);
        assert_eq!(store.stats().await.unwrap().orphan_count, 1);
    }

    #[tokio::test]
    async fn externally_deleted_blob_self_heals() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "a.bin");
        let (source, id) = stage(&store, "a", b"bytes").await;
        let outcome = store.publish(&file, &id, source).await.unwrap();

        std::fs::remove_file(outcome.blob_path).unwrap();

        assert_eq!(store.lookup(&file).await.unwrap(), None);
        assert!(store.entry(&id).is_none());
        assert_eq!(store.total_size(), 0);
    }

    #[tokio::test]
    async fn externally_deleted_link_drops_reference() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "x.bin");
        let (source, id) = stage(&store, "a", b"0123456789").await;
        store.publish(&file, &id, source).await.unwrap();

        std::fs::remove_file(store.layout().snapshot_path(&file).unwrap()).unwrap();

        assert_eq!(store.lookup(&file).await.unwrap(), None);
        assert_eq!(store.content_id_of(&file), None);
        assert_eq!(store.entry(&id).unwrap().ref_count, 0);
        assert_eq!(store.eviction_candidates(), vec![(id.clone(), 10)]);
        assert_eq!(store.try_remove_unreferenced(&id).await.unwrap(), Some(10));
        assert_eq!(store.lookup(&file).await.unwrap(), None);
    }

    #[tokio::test]
    async fn damaged_blob_is_replaced_by_verified_download() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "model.bin");
        let (source, id) = stage(&store, "a", b"0123456789").await;
        let outcome = store.publish(&file, &id, source).await.unwrap();

        std::fs::write(&outcome.blob_path, b"01234").unwrap();

        let (again, _) = stage(&store, "b", b"0123456789").await;
        let BlobSource::Temp(temp) = again.clone() else {
            unreachable!()
        };
        let outcome = store.publish(&file, &id, again).await.unwrap();
        assert!(!outcome.new_blob);
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&outcome.blob_path).unwrap(), b"0123456789");
        assert_eq!(store.entry(&id).unwrap().size_bytes, 10);
        assert_eq!(store.total_size(), 10);
    }

    #[tokio::test]
    async fn miss_adopts_publication_from_another_store() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir).await;
        let second = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "tokenizer.json");

        let (source, id) = stage(&first, "a", b"shared").await;
        first.publish(&file, &id, source).await.unwrap();

        let path = second.lookup(&file).await.unwrap().unwrap();
        assert_eq!(path, second.layout().blob_path(&id).unwrap());
        assert_eq!(second.content_id_of(&file), Some(id));
        assert_eq!(second.total_size(), 6);
    }

    #[tokio::test]
    async fn remove_drops_blob_and_refs() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let a = FileRef::model("gpt2", "main", "a.bin");
        let b = FileRef::model("gpt2", "dev", "a.bin");
        let (source, id) = stage(&store, "a", b"12345").await;
        store.publish(&a, &id, source).await.unwrap();
        store.publish(&b, &id, BlobSource::Existing).await.unwrap();

        assert_eq!(store.remove(&id).await.unwrap(), 5);
        assert_eq!(store.lookup(&a).await.unwrap(), None);
        assert_eq!(store.lookup(&b).await.unwrap(), None);
        assert!(!store.layout().snapshot_path(&a).unwrap().exists());
        assert_eq!(store.total_size(), 0);

        assert!(matches!(
            store.remove(&id).await,
            Err(CacheError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn referenced_blobs_are_not_removed_as_unreferenced() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let file = FileRef::model("gpt2", "main", "a.bin");
        let (source, id) = stage(&store, "a", b"keep me").await;
        store.publish(&file, &id, source).await.unwrap();

        assert_eq!(store.try_remove_unreferenced(&id).await.unwrap(), None);
        assert!(store.lookup(&file).await.unwrap().is_some());

        assert!(store.unlink(&file).await.unwrap());
        assert_eq!(store.try_remove_unreferenced(&id).await.unwrap(), Some(7));
        assert!(!store.unlink(&file).await.unwrap());
    }

    #[tokio::test]
    async fn clear_counts_refs_and_removes_orphaned_blobs() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let a = FileRef::model("org/a", "main", "x.bin");
        let b = FileRef::model("org/b", "main", "y.bin");
        let stray = FileRef::model("org/c", "main", "z.bin");

        let (sa, ida) = stage(&store, "a", b"aaaa").await;
        store.publish(&a, &ida, sa).await.unwrap();
        let (sb, idb) = stage(&store, "b", b"bbbbbb").await;
        store.publish(&b, &idb, sb).await.unwrap();
        let (sc, idc) = stage(&store, "c", b"cc").await;
        store.publish(&stray, &idc, sc).await.unwrap();
        store.unlink(&stray).await.unwrap();

        assert_eq!(store.clear(Some("org/a"), None).await.unwrap(), 1);
        assert!(store.entry(&ida).is_none());
        // pre-existing orphans survive a filtered clear
        assert!(store.entry(&idc).is_some());

        assert_eq!(store.clear(None, None).await.unwrap(), 1);
        assert!(store.entry(&idb).is_none());
        assert!(store.entry(&idc).is_none());
        assert_eq!(store.total_size(), 0);
    }

    #[tokio::test]
    async fn reopening_rebuilds_from_disk() {
        let dir = TempDir::new().unwrap();
        let (id, file) = {
            let store = open(&dir).await;
            let file = FileRef::new(RepoKind::Dataset, "org/data", "refs/pr/3", "train/part-0.csv");
            let (source, id) = stage(&store, "a", b"a,b,c").await;
            store.publish(&file, &id, source).await.unwrap();
            std::fs::write(store.layout().temp_path("interrupted"), b"par").unwrap();
            (id, file)
        };

        let store = open(&dir).await;
        assert_eq!(store.content_id_of(&file), Some(id.clone()));
        assert_eq!(store.entry(&id).unwrap().ref_count, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_size_bytes, 5);
        assert_eq!(stats.partial_count, 1);
        assert!(stats.repo_ids.contains("org/data"));
    }
}
