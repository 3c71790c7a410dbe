//! # Download
//!
//! Fetching files into the cache: temp files with resumable sidecars, and the
//! engine that drives a request from cache check to publication.

pub mod attempt;
pub mod engine;

use std::sync::Arc;

use crate::repo::FileRef;

pub use attempt::{DownloadAttempt, PartialMeta};
pub use engine::DownloadEngine;

/// Progress notifications emitted while ensuring a file is present
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// The file was already cached, or linked to an identical cached blob
    CacheHit { file: FileRef },
    /// Bytes are about to stream; `resumed_from` is non-zero for a resume
    Started {
        file: FileRef,
        total: Option<u64>,
        resumed_from: u64,
    },
    Progress {
        file: FileRef,
        received: u64,
        total: Option<u64>,
    },
    Finished { file: FileRef, bytes: u64 },
}

/// Callback receiving [`DownloadEvent`]s
pub type OnEvent = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;
