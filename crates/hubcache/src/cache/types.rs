use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::repo::RepoKind;

/// One cached blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub content_id: String,
    pub size_bytes: u64,
    pub blob_path: PathBuf,
    /// Logical access tick; higher is more recent
    pub last_access: u64,
    pub last_accessed_at: SystemTime,
    /// Number of snapshot references resolving to this blob
    pub ref_count: usize,
}

impl CacheEntry {
    pub fn is_referenced(&self) -> bool {
        self.ref_count > 0
    }
}

/// Aggregate view of the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Bytes held by distinct blobs
    pub total_size_bytes: u64,
    pub entry_count: usize,
    pub repo_ids: BTreeSet<String>,
    pub repos: Vec<RepoStats>,
    /// Blobs no snapshot refers to
    pub orphan_count: usize,
    /// Interrupted downloads waiting in `tmp/`
    pub partial_count: usize,
}

/// Per-repository slice of [`CacheStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStats {
    pub kind: RepoKind,
    pub repo_id: String,
    /// Bytes of the distinct blobs this repository refers to
    pub size_on_disk: u64,
    pub nb_files: usize,
    pub revisions: BTreeSet<String>,
    pub last_accessed_at: Option<SystemTime>,
}

/// Where the bytes of a blob being published come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// A finished temp file, renamed into place unless the blob already exists
    Temp(PathBuf),
    /// The blob is already in the cache; only the reference is added
    Existing,
}

/// Result of publishing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub blob_path: PathBuf,
    /// False when the content was already cached
    pub new_blob: bool,
}
