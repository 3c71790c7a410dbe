//! # Download attempts
//!
//! One in-flight download: a temp file under `tmp/` plus a JSON sidecar that
//! records which content the partial bytes belong to. A later attempt only
//! continues a partial when the sidecar still matches what the hub serves.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::cache::layout::CacheLayout;
use crate::error::CacheResult;
use crate::remote::{RemoteError, RemoteFile};
use crate::repo::FileRef;

/// Sidecar written next to a partial download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialMeta {
    pub file: String,
    pub content_id: Option<String>,
    pub total_size: Option<u64>,
    pub started_at: u64,
}

#[derive(Debug)]
pub struct DownloadAttempt {
    pub key: String,
    pub temp_path: PathBuf,
    pub meta_path: PathBuf,
    pub bytes_received: u64,
    pub started_at: SystemTime,
    hasher: Sha256,
    meta: Option<PartialMeta>,
}

impl DownloadAttempt {
    /// Prepare an attempt for `file`, keeping a partial left by an earlier
    /// attempt only when its sidecar names the same content id and total size
    /// as `expected` and the partial is no longer than that size.
    pub async fn open(
        layout: &CacheLayout,
        file: &FileRef,
        expected: &RemoteFile,
    ) -> CacheResult<Self> {
        let key = CacheLayout::download_key(file);
        let mut attempt = Self {
            temp_path: layout.temp_path(&key),
            meta_path: layout.meta_path(&key),
            key,
            bytes_received: 0,
            started_at: SystemTime::now(),
            hasher: Sha256::new(),
            meta: None,
        };

        let partial_len = fs::metadata(&attempt.temp_path)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());
        let sidecar = match fs::read(&attempt.meta_path).await {
            Ok(contents) => serde_json::from_slice::<PartialMeta>(&contents).ok(),
            Err(_) => None,
        };

        let resumable = match (partial_len, &sidecar, &expected.content_id, expected.size) {
            (Some(received), Some(meta), Some(content_id), Some(total)) => {
                meta.content_id.as_deref() == Some(content_id.as_str())
                    && meta.total_size == Some(total)
                    && received > 0
                    && received <= total
            }
            _ => false,
        };

        if resumable {
            attempt.hash_existing().await?;
            if let Some(meta) = &sidecar {
                attempt.started_at = UNIX_EPOCH + std::time::Duration::from_secs(meta.started_at);
            }
            attempt.meta = sidecar;
            debug!(file = %file, offset = attempt.bytes_received, "Found resumable partial download");
        } else if partial_len.is_some() || sidecar.is_some() {
            debug!(file = %file, "Discarding partial download that no longer matches");
            attempt.reset().await?;
        }
        Ok(attempt)
    }

    pub fn is_resume(&self) -> bool {
        self.bytes_received > 0
    }

    /// Identity the partial bytes were started against
    pub fn meta(&self) -> Option<&PartialMeta> {
        self.meta.as_ref()
    }

    /// Delete the partial and its sidecar and start over from byte zero
    pub async fn reset(&mut self) -> CacheResult<()> {
        remove_file_if_exists(&self.temp_path).await?;
        remove_file_if_exists(&self.meta_path).await?;
        self.bytes_received = 0;
        self.hasher = Sha256::new();
        self.meta = None;
        self.started_at = SystemTime::now();
        Ok(())
    }

    /// Record what is about to be streamed; a fresh attempt writes its sidecar
    /// before any bytes reach the temp file
    pub async fn begin(
        &mut self,
        file: &FileRef,
        content_id: Option<String>,
        total_size: Option<u64>,
    ) -> CacheResult<()> {
        if self.is_resume() {
            return Ok(());
        }
        let meta = PartialMeta {
            file: file.to_string(),
            content_id,
            total_size,
            started_at: self
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        fs::write(&self.meta_path, serde_json::to_vec(&meta)?).await?;
        self.meta = Some(meta);
        Ok(())
    }

    /// Append `stream` to the temp file, calling `on_chunk` with the running
    /// byte count. Bytes written before a stream error stay on disk.
    pub async fn write_stream(
        &mut self,
        mut stream: BoxStream<'static, Result<Bytes, RemoteError>>,
        buffer_size: usize,
        mut on_chunk: impl FnMut(u64),
    ) -> Result<(), StreamFailure> {
        let file = OpenOptions::new()
            .create(true)
            .append(self.is_resume())
            .write(true)
            .truncate(!self.is_resume())
            .open(&self.temp_path)
            .await
            .map_err(StreamFailure::Io)?;
        let mut writer = BufWriter::with_capacity(buffer_size, file);

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(flush_err) = writer.flush().await {
                        warn!(path = ?self.temp_path, error = %flush_err, "Failed to flush partial download");
                    }
                    return Err(StreamFailure::Remote(e));
                }
            };
            writer.write_all(&chunk).await.map_err(StreamFailure::Io)?;
            self.hasher.update(&chunk);
            self.bytes_received += chunk.len() as u64;
            on_chunk(self.bytes_received);
        }

        writer.flush().await.map_err(StreamFailure::Io)?;
        writer.get_ref().sync_all().await.map_err(StreamFailure::Io)?;
        Ok(())
    }

    /// SHA-256 hex digest of every byte received, resumed prefix included
    pub fn digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    /// Remove the sidecar once the temp file has been published
    pub async fn complete(self) {
        if let Err(e) = remove_file_if_exists(&self.meta_path).await {
            warn!(path = ?self.meta_path, error = %e, "Failed to remove download sidecar");
        }
    }

    async fn hash_existing(&mut self) -> CacheResult<()> {
        let mut file = fs::File::open(&self.temp_path).await?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            self.hasher.update(&buf[..read]);
            total += read as u64;
        }
        self.bytes_received = total;
        Ok(())
    }
}

/// Why streaming into the temp file stopped early
#[derive(Debug)]
pub enum StreamFailure {
    Remote(RemoteError),
    Io(io::Error),
}

async fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
