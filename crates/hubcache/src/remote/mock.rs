//! Scripted in-memory hub used by the engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::remote::provider::{
    ByteRange, FetchResponse, HubRemote, RemoteError, RemoteFile, RemoteMetadata,
};
use crate::repo::{FileRef, RepoKind};

const CHUNK_SIZE: usize = 4;

#[derive(Debug, Clone)]
struct MockFile {
    content: Bytes,
    content_id: Option<String>,
    declared_size: Option<u64>,
}

#[derive(Debug, Default)]
struct Script {
    files: HashMap<FileRef, MockFile>,
    // Next fetch streams this many bytes, then fails
    fail_after: Option<usize>,
    ignore_ranges: bool,
    fetch_delay: Option<Duration>,
    // Next `n` fetches serve these bytes instead of the listed content
    tampered: Option<(Bytes, usize)>,
}

#[derive(Debug, Default)]
pub(crate) struct MockRemote {
    script: Mutex<Script>,
    ranges: Mutex<Vec<Option<ByteRange>>>,
    metadata_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    bytes_served: AtomicU64,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` under `file`, identified by its SHA-256
    pub fn add(&self, file: &FileRef, content: &[u8]) -> String {
        let id = hex::encode(Sha256::digest(content));
        self.add_with_id(file, content, Some(id.clone()));
        id
    }

    pub fn add_with_id(&self, file: &FileRef, content: &[u8], content_id: Option<String>) {
        self.script.lock().files.insert(
            file.clone(),
            MockFile {
                content: Bytes::copy_from_slice(content),
                content_id,
                declared_size: None,
            },
        );
    }

    pub fn declare_size(&self, file: &FileRef, size: u64) {
        if let Some(entry) = self.script.lock().files.get_mut(file) {
            entry.declared_size = Some(size);
        }
    }

    pub fn fail_next_after(&self, bytes: usize) {
        self.script.lock().fail_after = Some(bytes);
    }

    pub fn ignore_ranges(&self, ignore: bool) {
        self.script.lock().ignore_ranges = ignore;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.script.lock().fetch_delay = Some(delay);
    }

    pub fn tamper_next(&self, content: &[u8], times: usize) {
        self.script.lock().tampered = Some((Bytes::copy_from_slice(content), times));
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Option<ByteRange>> {
        self.ranges.lock().clone()
    }
}

#[async_trait::async_trait]
impl HubRemote for MockRemote {
    async fn fetch_metadata(
        &self,
        kind: RepoKind,
        repo_id: &str,
        revision: &str,
    ) -> Result<RemoteMetadata, RemoteError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        let files: HashMap<String, RemoteFile> = script
            .files
            .iter()
            .filter(|(file, _)| {
                file.kind == kind && file.repo_id == repo_id && file.revision == revision
            })
            .map(|(file, entry)| {
                (
                    file.filename.clone(),
                    RemoteFile {
                        size: Some(
                            entry
                                .declared_size
                                .unwrap_or(entry.content.len() as u64),
                        ),
                        content_id: entry.content_id.clone(),
                    },
                )
            })
            .collect();
        if files.is_empty() {
            return Err(RemoteError::NotFound(format!("{kind}:{repo_id}@{revision}")));
        }
        Ok(RemoteMetadata {
            commit: Some(format!("commit-{revision}")),
            files,
        })
    }

    async fn fetch_bytes(
        &self,
        file: &FileRef,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, RemoteError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().push(range);

        let delay = self.script.lock().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        let entry = script
            .files
            .get(file)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(file.to_string()))?;

        let mut content = entry.content.clone();
        if let Some((bytes, remaining)) = script.tampered.take() {
            content = bytes.clone();
            if remaining > 1 {
                script.tampered = Some((bytes, remaining - 1));
            }
        }

        let start = match range {
            Some(range) if !script.ignore_ranges => range.start,
            _ => 0,
        };
        if start > content.len() as u64 {
            return Err(RemoteError::RangeNotSatisfiable);
        }

        let mut body = content.slice(start as usize..);
        let failure = script.fail_after.take().map(|limit| {
            body = body.slice(..limit.min(body.len()));
            RemoteError::Transient("connection reset".to_string())
        });
        self.bytes_served
            .fetch_add(body.len() as u64, Ordering::SeqCst);

        let mut chunks: Vec<Result<Bytes, RemoteError>> = body
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        chunks.extend(failure.map(Err));

        Ok(FetchResponse {
            range_start: start,
            total_size: Some(content.len() as u64),
            content_id: entry.content_id,
            stream: stream::iter(chunks).boxed(),
        })
    }
}
