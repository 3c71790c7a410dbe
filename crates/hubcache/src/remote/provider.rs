//! # Remote collaborator
//!
//! The cache consumes the hub through this trait: one call lists a
//! revision's files with their sizes and content ids, the other streams a
//! file's bytes, optionally from an offset.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use futures::stream::BoxStream;

use crate::repo::{FileRef, RepoKind};

/// Errors reported by a remote collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("{0}")]
    Other(String),
}

/// A file as described by the hub's revision listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFile {
    pub size: Option<u64>,
    pub content_id: Option<String>,
}

/// Listing of a repository revision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Commit the revision resolved to, when the hub reports it
    pub commit: Option<String>,
    pub files: HashMap<String, RemoteFile>,
}

impl RemoteMetadata {
    pub fn file(&self, filename: &str) -> Option<&RemoteFile> {
        self.files.get(filename)
    }
}

/// Byte range `start..=end`; an open end runs to the end of the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Value of an HTTP `Range` header
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Streamed response to a byte fetch
pub struct FetchResponse {
    /// Offset of the first streamed byte; zero when a range was ignored
    pub range_start: u64,
    /// Size of the whole file, when known
    pub total_size: Option<u64>,
    /// Identity of the content being served, when known
    pub content_id: Option<String>,
    pub stream: BoxStream<'static, Result<Bytes, RemoteError>>,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("range_start", &self.range_start)
            .field("total_size", &self.total_size)
            .field("content_id", &self.content_id)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait HubRemote: Send + Sync + 'static {
    /// List the files of `repo_id` at `revision`
    async fn fetch_metadata(
        &self,
        kind: RepoKind,
        repo_id: &str,
        revision: &str,
    ) -> Result<RemoteMetadata, RemoteError>;

    /// Stream the bytes of `file`, from `range` when given
    async fn fetch_bytes(
        &self,
        file: &FileRef,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, RemoteError>;
}

/// Strip the weak prefix and quotes from an entity tag
pub fn normalize_etag(value: &str) -> Option<String> {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    let value = value.trim_matches('"');
    (!value.is_empty()).then(|| value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etags_are_normalized() {
        assert_eq!(normalize_etag("\"abc123\"").as_deref(), Some("abc123"));
        assert_eq!(normalize_etag("W/\"abc-1\"").as_deref(), Some("abc-1"));
        assert_eq!(normalize_etag(" plain ").as_deref(), Some("plain"));
        assert_eq!(normalize_etag("\"\""), None);
    }

    #[test]
    fn range_headers() {
        assert_eq!(ByteRange::from(10).to_header(), "bytes=10-");
        let bounded = ByteRange {
            start: 0,
            end: Some(99),
        };
        assert_eq!(bounded.to_header(), "bytes=0-99");
    }
}
