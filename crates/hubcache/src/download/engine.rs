//! # Download Engine
//!
//! Drives one "make this file present locally" request:
//!
//! ```text
//! CHECK_CACHE ── hit ──────────────────────────────────────────────► DONE
//!      │ miss
//!      ▼
//! ACQUIRE_LOCK → re-check → listing → dedup ── linked ─────────────► DONE
//!                                       │ fetch
//!                                       ▼
//!                 RESUME_OR_START → STREAM → VERIFY → PUBLISH → RELEASE_LOCK
//! ```
//!
//! Identical concurrent requests share the download lock, so only one of them
//! streams bytes; the others find the published file on their re-check.

use std::path::PathBuf;
use std::sync::Arc;

use moka::future::Cache;
use tracing::{debug, info, instrument, warn};

use crate::cache::layout::{CacheLayout, is_sha256_hex, is_valid_content_id};
use crate::cache::lock::{LockGuard, LockKey};
use crate::cache::{BlobSource, Evictor, MetadataStore};
use crate::config::CacheConfig;
use crate::download::attempt::{DownloadAttempt, StreamFailure};
use crate::download::{DownloadEvent, OnEvent};
use crate::error::{CacheError, CacheResult};
use crate::remote::{ByteRange, FetchResponse, HubRemote, RemoteError, RemoteFile, RemoteMetadata};
use crate::repo::{FileRef, RepoKind};

type ListingKey = (RepoKind, String, String);

pub struct DownloadEngine<R: HubRemote> {
    remote: Arc<R>,
    store: Arc<MetadataStore>,
    evictor: Evictor,
    config: CacheConfig,
    listings: Cache<ListingKey, Arc<RemoteMetadata>>,
    on_event: Option<OnEvent>,
}

impl<R: HubRemote> DownloadEngine<R> {
    pub fn new(remote: Arc<R>, store: Arc<MetadataStore>, config: CacheConfig) -> Self {
        let listings = Cache::builder()
            .max_capacity(config.metadata_cache_capacity)
            .time_to_live(config.metadata_ttl)
            .build();
        Self {
            evictor: Evictor::new(Arc::clone(&store)),
            remote,
            store,
            config,
            listings,
            on_event: None,
        }
    }

    pub fn with_event_handler(mut self, handler: OnEvent) -> Self {
        self.on_event = Some(handler);
        self
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn evictor(&self) -> &Evictor {
        &self.evictor
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Make `file` present in the cache and return its blob path.
    ///
    /// A cached file costs no network call and no lock. Otherwise the file's
    /// download lock is taken once for the whole fetch, a partial left by an
    /// earlier attempt is resumed when it still matches, and the verified
    /// bytes are published before the lock is released.
    #[instrument(skip_all, fields(file = %file), level = "debug")]
    pub async fn ensure_present(&self, file: &FileRef) -> CacheResult<PathBuf> {
        file.validate()?;
        if let Some(path) = self.cached(file).await? {
            return Ok(path);
        }

        let lock = self
            .store
            .locks()
            .acquire(&LockKey::Download(CacheLayout::download_key(file)))
            .await?;
        let result = self.fetch_locked(file, &lock).await;
        drop(lock);
        let path = result?;

        if let Some(max_size) = self.config.max_size_bytes {
            if let Err(e) = self.evictor.enforce_budget(max_size).await {
                warn!(error = %e, "Automatic eviction failed");
            }
        }
        Ok(path)
    }

    /// Drop the memoized listing of a revision
    pub async fn invalidate_listing(&self, kind: RepoKind, repo_id: &str, revision: &str) {
        self.listings
            .invalidate(&(kind, repo_id.to_owned(), revision.to_owned()))
            .await;
    }

    async fn cached(&self, file: &FileRef) -> CacheResult<Option<PathBuf>> {
        let Some(path) = self.store.lookup(file).await? else {
            return Ok(None);
        };
        if let Some(content_id) = self.store.content_id_of(file) {
            self.store.record_access(&content_id);
        }
        debug!(file = %file, "Cache hit");
        self.emit(DownloadEvent::CacheHit { file: file.clone() });
        Ok(Some(path))
    }

    // Runs with the file's download lock held by the caller
    async fn fetch_locked(&self, file: &FileRef, _lock: &LockGuard) -> CacheResult<PathBuf> {
        if let Some(path) = self.cached(file).await? {
            return Ok(path);
        }

        let remote_file = self.resolve_remote(file).await?;

        if let Some(content_id) = remote_file
            .content_id
            .as_deref()
            .filter(|id| is_valid_content_id(id))
        {
            if self.store.has_blob(content_id).await {
                match self
                    .store
                    .publish(file, content_id, BlobSource::Existing)
                    .await
                {
                    Ok(outcome) => {
                        debug!(file = %file, content_id = %content_id, "Linked to cached content");
                        self.emit(DownloadEvent::CacheHit { file: file.clone() });
                        return Ok(outcome.blob_path);
                    }
                    // Evicted between the check and the link
                    Err(CacheError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut restarts = 0;
        loop {
            match self.fetch_once(file, &remote_file).await {
                Err(CacheError::CorruptDownload { reason, .. })
                    if restarts < self.config.corrupt_retries =>
                {
                    restarts += 1;
                    warn!(file = %file, reason = %reason, restarts, "Corrupt download, restarting from scratch");
                }
                other => return other,
            }
        }
    }

    async fn resolve_remote(&self, file: &FileRef) -> CacheResult<RemoteFile> {
        let key = (file.kind, file.repo_id.clone(), file.revision.clone());
        let listing = self.listing(&key).await.map_err(|e| CacheError::from_remote(file, e))?;
        if let Some(remote_file) = listing.file(&file.filename) {
            return Ok(remote_file.clone());
        }

        // A memoized listing can predate the file
        self.listings.invalidate(&key).await;
        let listing = self.listing(&key).await.map_err(|e| CacheError::from_remote(file, e))?;
        listing
            .file(&file.filename)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(file.to_string()))
    }

    async fn listing(&self, key: &ListingKey) -> Result<Arc<RemoteMetadata>, RemoteError> {
        let (kind, repo_id, revision) = key;
        self.listings
            .try_get_with(key.clone(), async {
                self.remote
                    .fetch_metadata(*kind, repo_id, revision)
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|e| (*e).clone())
    }

    async fn fetch_once(&self, file: &FileRef, remote_file: &RemoteFile) -> CacheResult<PathBuf> {
        let mut attempt = DownloadAttempt::open(self.store.layout(), file, remote_file).await?;
        let expected_id = remote_file
            .content_id
            .clone()
            .filter(|id| is_valid_content_id(id));

        let response = self
            .open_stream(file, &mut attempt, expected_id.as_deref(), remote_file.size)
            .await?;
        let total = remote_file
            .size
            .or_else(|| response.as_ref().and_then(|r| r.total_size));

        if let Some(response) = response {
            let content_id = expected_id.clone().or_else(|| {
                response
                    .content_id
                    .clone()
                    .filter(|id| is_valid_content_id(id))
            });
            attempt.begin(file, content_id, total).await?;
            self.emit(DownloadEvent::Started {
                file: file.clone(),
                total,
                resumed_from: attempt.bytes_received,
            });

            let progress = |received| {
                self.emit(DownloadEvent::Progress {
                    file: file.clone(),
                    received,
                    total,
                })
            };
            match attempt
                .write_stream(response.stream, self.config.write_buffer_size, progress)
                .await
            {
                Ok(()) => {}
                Err(StreamFailure::Remote(e)) => {
                    warn!(
                        file = %file,
                        received = attempt.bytes_received,
                        error = %e,
                        "Download interrupted, partial kept for resume"
                    );
                    return Err(CacheError::from_remote(file, e));
                }
                Err(StreamFailure::Io(e)) => return Err(e.into()),
            }
        }

        let content_id = self.verify(file, &mut attempt, total).await?;
        let received = attempt.bytes_received;
        let outcome = self
            .store
            .publish(file, &content_id, BlobSource::Temp(attempt.temp_path.clone()))
            .await?;
        attempt.complete().await;

        info!(
            file = %file,
            bytes = received,
            content_id = %content_id,
            new_blob = outcome.new_blob,
            "Download complete"
        );
        self.emit(DownloadEvent::Finished {
            file: file.clone(),
            bytes: received,
        });
        Ok(outcome.blob_path)
    }

    /// Request the bytes still missing from `attempt`.
    ///
    /// Returns `None` when the partial already holds the whole file. Falls
    /// back to a download from byte zero when the hub cannot continue the
    /// partial: an unsatisfiable range, an ignored range or different content.
    async fn open_stream(
        &self,
        file: &FileRef,
        attempt: &mut DownloadAttempt,
        expected_id: Option<&str>,
        expected_size: Option<u64>,
    ) -> CacheResult<Option<FetchResponse>> {
        loop {
            let offset = attempt.bytes_received;
            if offset > 0 && Some(offset) == expected_size {
                debug!(file = %file, "Partial download already complete");
                return Ok(None);
            }

            let range = (offset > 0).then(|| ByteRange::from(offset));
            let response = match self.remote.fetch_bytes(file, range).await {
                Ok(response) => response,
                Err(RemoteError::RangeNotSatisfiable) if offset > 0 => {
                    debug!(file = %file, offset, "Range not satisfiable, restarting from byte 0");
                    attempt.reset().await?;
                    continue;
                }
                Err(e) => return Err(CacheError::from_remote(file, e)),
            };

            if offset == 0 {
                if response.range_start != 0 {
                    return Err(CacheError::Remote(format!(
                        "hub served {file} from byte {} instead of 0",
                        response.range_start
                    )));
                }
                return Ok(Some(response));
            }

            let changed = matches!(
                (response.content_id.as_deref(), expected_id),
                (Some(served), Some(expected)) if served != expected
            );
            if !changed && response.range_start == offset {
                debug!(file = %file, offset, "Resuming download");
                return Ok(Some(response));
            }

            debug!(
                file = %file,
                offset,
                served_from = response.range_start,
                content_changed = changed,
                "Cannot resume, restarting from byte 0"
            );
            attempt.reset().await?;
            // A full response to a ranged request is already the restart
            if !changed && response.range_start == 0 {
                return Ok(Some(response));
            }
        }
    }

    /// Check size and digest; returns the content id to publish under
    async fn verify(
        &self,
        file: &FileRef,
        attempt: &mut DownloadAttempt,
        total: Option<u64>,
    ) -> CacheResult<String> {
        let received = attempt.bytes_received;
        if let Some(total) = total {
            if received != total {
                let reason = format!("received {received} bytes, expected {total}");
                return Err(self.corrupt(file, attempt, reason).await);
            }
        }

        let digest = attempt.digest();
        let declared = attempt.meta().and_then(|meta| meta.content_id.clone());
        match declared {
            Some(content_id) if is_sha256_hex(&content_id) => {
                if !content_id.eq_ignore_ascii_case(&digest) {
                    let reason = format!("sha256 {digest} does not match {content_id}");
                    return Err(self.corrupt(file, attempt, reason).await);
                }
                Ok(content_id)
            }
            // Not a digest we can recompute; the size check above is all we have
            Some(content_id) => Ok(content_id),
            None => Ok(digest),
        }
    }

    async fn corrupt(
        &self,
        file: &FileRef,
        attempt: &mut DownloadAttempt,
        reason: String,
    ) -> CacheError {
        warn!(file = %file, reason = %reason, "Discarding corrupt download");
        if let Err(e) = attempt.reset().await {
            warn!(path = ?attempt.temp_path, error = %e, "Failed to remove corrupt download");
        }
        CacheError::CorruptDownload {
            file: file.to_string(),
            reason,
        }
    }

    fn emit(&self, event: DownloadEvent) {
        if let Some(handler) = &self.on_event {
            handler(&event);
        }
    }
}
