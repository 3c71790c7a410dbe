//! # hubcache
//!
//! A disk-backed, content-addressed cache for files served by a model hub.
//!
//! Files are addressed by repository kind, repository id, revision and
//! filename. Their bytes are stored once per distinct content under
//! `blobs/`, and each addressed file is a link under `snapshots/` pointing at
//! its blob. Downloads stream into `tmp/` and resume after interruptions;
//! concurrent requests for the same file share one download, also across
//! processes using the same cache directory. Unreferenced content is evicted
//! least recently used first when the cache grows past its size budget.
//!
//! ```no_run
//! use hubcache::{CacheConfig, FileRef, HttpConfig, HubCache};
//!
//! # async fn run() -> hubcache::CacheResult<()> {
//! let cache = HubCache::with_http(
//!     CacheConfig::builder()
//!         .with_cache_dir("/var/cache/hub")
//!         .with_max_size(50 * 1024 * 1024 * 1024)
//!         .build(),
//!     HttpConfig::default(),
//! )
//! .await?;
//!
//! let config = cache
//!     .ensure_present(&FileRef::model("openai-community/gpt2", "main", "config.json"))
//!     .await?;
//! println!("config at {}", config.display());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod download;
pub mod downloader;
pub mod error;
pub mod remote;
pub mod repo;

pub use builder::{CacheConfigBuilder, HttpConfigBuilder};
pub use cache::{CacheEntry, CacheStats, EvictionReport, RepoStats};
pub use config::{CacheConfig, DEFAULT_ENDPOINT, HttpConfig};
pub use download::{DownloadEvent, OnEvent};
pub use downloader::HubCache;
pub use error::{CacheError, CacheResult};
pub use remote::{
    ByteRange, FetchResponse, HttpRemote, HubRemote, RemoteError, RemoteFile, RemoteMetadata,
};
pub use repo::{FileRef, RepoKind};
