//! # Disk scanner
//!
//! Rebuilds the view of the cache from the on-disk layout. The layout is the
//! durable source of truth; the in-memory index is derived from what this
//! module finds.
//!
//! Runs on blocking threads.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::layout::{CacheLayout, LOCK_EXT, PARTIAL_EXT, is_valid_content_id};
use crate::repo::FileRef;

/// Prefix of the temporary links created while replacing a snapshot
pub(crate) const TEMP_LINK_PREFIX: &str = ".hubcache-link-";

#[derive(Debug, Clone)]
pub struct ScannedBlob {
    pub content_id: String,
    pub size_bytes: u64,
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ScannedRef {
    pub file: FileRef,
    pub content_id: String,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub blobs: Vec<ScannedBlob>,
    pub refs: Vec<ScannedRef>,
    pub partial_count: usize,
    /// Dangling or leftover links deleted during the scan
    pub removed_links: usize,
}

pub fn scan_cache(layout: &CacheLayout) -> io::Result<ScanResult> {
    let mut result = ScanResult {
        blobs: scan_blobs(layout)?,
        ..ScanResult::default()
    };

    let known: HashMap<&str, &ScannedBlob> = result
        .blobs
        .iter()
        .map(|blob| (blob.content_id.as_str(), blob))
        .collect();
    let mut refs = Vec::new();
    let mut removed_links = 0;

    for path in walk_files(&layout.snapshots_dir())? {
        let is_temp_link = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(TEMP_LINK_PREFIX));
        if is_temp_link {
            remove_link(&path, &mut removed_links);
            continue;
        }

        let Some(file) = layout.parse_snapshot(&path) else {
            debug!(path = ?path, "Skipping unrecognized snapshot entry");
            continue;
        };
        let Ok(link_meta) = fs::symlink_metadata(&path) else {
            continue;
        };

        let content_id = if link_meta.file_type().is_symlink() {
            fs::read_link(&path)
                .ok()
                .and_then(|target| target.file_name().and_then(|n| n.to_str()).map(str::to_owned))
                .filter(|id| known.contains_key(id.as_str()))
        } else {
            identify_copy(&path, &known)
        };

        match content_id {
            Some(content_id) => refs.push(ScannedRef {
                file,
                content_id,
                modified: link_meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            }),
            None if link_meta.file_type().is_symlink() => {
                remove_link(&path, &mut removed_links);
            }
            None => debug!(path = ?path, "Snapshot copy matches no cached blob"),
        }
    }

    result.refs = refs;
    result.removed_links = removed_links;
    result.partial_count = count_partials(layout)?;
    Ok(result)
}

fn scan_blobs(layout: &CacheLayout) -> io::Result<Vec<ScannedBlob>> {
    let mut blobs = Vec::new();
    for path in walk_files(&layout.blobs_dir())? {
        let Some(content_id) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_valid_content_id(content_id) {
            continue;
        }
        // Only files at their canonical sharded location count as blobs
        match layout.blob_path(content_id) {
            Ok(expected) if expected == path => {}
            _ => continue,
        }
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        blobs.push(ScannedBlob {
            content_id: content_id.to_owned(),
            size_bytes: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        });
    }
    Ok(blobs)
}

pub fn count_partials(layout: &CacheLayout) -> io::Result<usize> {
    Ok(list_partials(layout)?.len())
}

/// Download keys of the partial files in `tmp/`
pub fn list_partials(layout: &CacheLayout) -> io::Result<Vec<String>> {
    list_tmp_stems(layout, PARTIAL_EXT)
}

/// Names of the lock files in `tmp/`, without extension
pub fn list_lock_names(layout: &CacheLayout) -> io::Result<Vec<String>> {
    list_tmp_stems(layout, LOCK_EXT)
}

fn list_tmp_stems(layout: &CacheLayout, ext: &str) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(layout.tmp_dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut stems = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(stem.to_owned());
        }
    }
    Ok(stems)
}

/// SHA-256 hex digest of a file's contents
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

// Snapshot copies carry no link target; match them by digest
fn identify_copy(path: &Path, known: &HashMap<&str, &ScannedBlob>) -> Option<String> {
    let digest = digest_file(path).ok()?;
    known.contains_key(digest.as_str()).then_some(digest)
}

fn remove_link(path: &Path, removed: &mut usize) {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = ?path, "Removed stale snapshot link");
            *removed += 1;
        }
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale snapshot link"),
    }
}

// Every non-directory entry below `root`; symlinks are not followed
fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_blob(layout: &CacheLayout, content: &[u8]) -> String {
        let id = hex::encode(Sha256::digest(content));
        let path = layout.blob_path(&id).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        id
    }

    #[cfg(unix)]
    fn link(layout: &CacheLayout, file: &FileRef, id: &str) -> PathBuf {
        let path = layout.snapshot_path(file).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(layout.link_target(file, id).unwrap(), &path).unwrap();
        path
    }

    #[test]
    fn empty_root_scans_clean() {
        let dir = TempDir::new().unwrap();
        let result = scan_cache(&CacheLayout::new(dir.path())).unwrap();
        assert!(result.blobs.is_empty());
        assert!(result.refs.is_empty());
        assert_eq!(result.partial_count, 0);
    }

    #[cfg(unix)]
    #[test]
    fn finds_blobs_refs_and_partials() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let id = write_blob(&layout, b"weights");
        let file = FileRef::model("org/name", "main", "sub/model.bin");
        link(&layout, &file, &id);

        fs::create_dir_all(layout.tmp_dir()).unwrap();
        fs::write(layout.temp_path("k1"), b"par").unwrap();
        fs::write(layout.meta_path("k1"), b"{}").unwrap();

        let result = scan_cache(&layout).unwrap();
        assert_eq!(result.blobs.len(), 1);
        assert_eq!(result.blobs[0].size_bytes, 7);
        assert_eq!(result.refs.len(), 1);
        assert_eq!(result.refs[0].file, file);
        assert_eq!(result.refs[0].content_id, id);
        assert_eq!(result.partial_count, 1);
        assert_eq!(list_partials(&layout).unwrap(), vec!["k1".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_links_are_removed() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let id = write_blob(&layout, b"gone soon");
        let file = FileRef::model("gpt2", "main", "config.json");
        let path = link(&layout, &file, &id);

        fs::remove_file(layout.blob_path(&id).unwrap()).unwrap();

        let result = scan_cache(&layout).unwrap();
        assert!(result.refs.is_empty());
        assert_eq!(result.removed_links, 1);
        assert!(fs::symlink_metadata(path).is_err());
    }

    #[test]
    fn copied_snapshots_match_by_digest() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let id = write_blob(&layout, b"copied bytes");
        let file = FileRef::model("gpt2", "main", "vocab.txt");
        let path = layout.snapshot_path(&file).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"copied bytes").unwrap();

        let result = scan_cache(&layout).unwrap();
        assert_eq!(result.refs.len(), 1);
        assert_eq!(result.refs[0].content_id, id);
    }

    #[test]
    fn misplaced_blobs_are_ignored() {
        let dir = TempDir::new().unwrap();
        let layout = CacheLayout::new(dir.path());
        let stray = layout.blobs_dir().join("zz").join("abcdef");
        fs::create_dir_all(stray.parent().unwrap()).unwrap();
        fs::write(stray, b"x").unwrap();

        let result = scan_cache(&layout).unwrap();
        assert!(result.blobs.is_empty());
    }
}
