//! # Cache Layout
//!
//! Pure mapping from repository coordinates and content ids to paths under the
//! cache root:
//!
//! ```text
//! <root>/blobs/<shard>/<content_id>                            content-addressed bytes
//! <root>/snapshots/<kind>/<repo_id>/<revision>/<filename>      link to a blob
//! <root>/tmp/<key>.part | .meta | .lock                        in-flight downloads
//! ```
//!
//! A `/` inside a repository id or revision is written as `--` so snapshot
//! paths can be parsed back into coordinates.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io;

use crate::error::{CacheError, CacheResult};
use crate::repo::{FileRef, RepoKind};

pub const BLOBS_DIR: &str = "blobs";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const TMP_DIR: &str = "tmp";

pub const PARTIAL_EXT: &str = "part";
pub const META_EXT: &str = "meta";
pub const LOCK_EXT: &str = "lock";

const SHARD_LEN: usize = 2;

#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Create the three top-level subtrees
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.blobs_dir()).await?;
        fs::create_dir_all(self.snapshots_dir()).await?;
        fs::create_dir_all(self.tmp_dir()).await?;
        Ok(())
    }

    /// Location of the blob holding `content_id`, sharded by its prefix
    pub fn blob_path(&self, content_id: &str) -> CacheResult<PathBuf> {
        if !is_valid_content_id(content_id) {
            return Err(CacheError::InvalidArgument(format!(
                "content id '{content_id}' is not a safe file name"
            )));
        }
        let shard = content_id.get(..SHARD_LEN).unwrap_or(content_id);
        Ok(self.blobs_dir().join(shard).join(content_id))
    }

    /// Location of the snapshot link for `file`
    pub fn snapshot_path(&self, file: &FileRef) -> CacheResult<PathBuf> {
        file.validate()?;
        let mut path = self
            .snapshots_dir()
            .join(file.kind.as_str())
            .join(encode_segment(&file.repo_id))
            .join(encode_segment(&file.revision));
        for part in file.filename.split('/') {
            path.push(part);
        }
        Ok(path)
    }

    /// Link target for `file`'s snapshot, relative to the link's directory
    pub fn link_target(&self, file: &FileRef, content_id: &str) -> CacheResult<PathBuf> {
        self.blob_path(content_id)?;
        // kind, repo and revision directories plus any filename subdirectories
        let depth = 4 + file.filename.split('/').count() - 1;
        let mut target = PathBuf::new();
        for _ in 0..depth {
            target.push("..");
        }
        let shard = content_id.get(..SHARD_LEN).unwrap_or(content_id);
        Ok(target.join(BLOBS_DIR).join(shard).join(content_id))
    }

    /// Deterministic key for an in-flight download of `file`
    pub fn download_key(file: &FileRef) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file.kind.as_str());
        hasher.update("\0");
        hasher.update(&file.repo_id);
        hasher.update("\0");
        hasher.update(&file.revision);
        hasher.update("\0");
        hasher.update(&file.filename);
        hex::encode(hasher.finalize())
    }

    pub fn temp_path(&self, key: &str) -> PathBuf {
        self.tmp_dir().join(format!("{key}.{PARTIAL_EXT}"))
    }

    pub fn meta_path(&self, key: &str) -> PathBuf {
        self.tmp_dir().join(format!("{key}.{META_EXT}"))
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.tmp_dir().join(format!("{name}.{LOCK_EXT}"))
    }

    /// Recover the coordinates a snapshot path was built from
    pub fn parse_snapshot(&self, path: &Path) -> Option<FileRef> {
        let relative = path.strip_prefix(self.snapshots_dir()).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_owned()),
                _ => return None,
            }
        }
        if parts.len() < 4 {
            return None;
        }

        let kind = parts[0].parse::<RepoKind>().ok()?;
        if kind.as_str() != parts[0] {
            return None;
        }
        let file = FileRef::new(
            kind,
            decode_segment(&parts[1]),
            decode_segment(&parts[2]),
            parts[3..].join("/"),
        );
        file.validate().ok()?;
        Some(file)
    }
}

/// Content ids become file names, so only a conservative alphabet is allowed
pub fn is_valid_content_id(content_id: &str) -> bool {
    !content_id.is_empty()
        && content_id.len() <= 128
        && !content_id.starts_with('.')
        && content_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Whether `content_id` is a SHA-256 hex digest that can be checked locally
pub fn is_sha256_hex(content_id: &str) -> bool {
    content_id.len() == 64 && content_id.bytes().all(|b| b.is_ascii_hexdigit())
}

fn encode_segment(value: &str) -> String {
    value.replace('/', "--")
}

fn decode_segment(value: &str) -> String {
    value.replace("--", "/")
}
