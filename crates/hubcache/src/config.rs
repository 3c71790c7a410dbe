use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

const DEFAULT_USER_AGENT: &str = concat!("hubcache/", env!("CARGO_PKG_VERSION"));

/// Configuration for the cache core and download engine
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root directory holding `blobs/`, `snapshots/` and `tmp/`
    pub cache_dir: PathBuf,

    /// Total size budget for blobs; `None` disables automatic eviction
    pub max_size_bytes: Option<u64>,

    /// Maximum time to wait for another fetch of the same file; `None` waits forever
    pub lock_timeout: Option<Duration>,

    /// Interval between attempts on a contended advisory file lock
    pub lock_poll_interval: Duration,

    /// How long a revision's remote file listing is reused
    pub metadata_ttl: Duration,

    /// Upper bound on memoized revision listings
    pub metadata_cache_capacity: u64,

    /// Number of automatic from-scratch restarts after a corrupt download
    pub corrupt_retries: u32,

    /// Buffer size for writing streamed bytes to the temp file
    pub write_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("hubcache"),
            max_size_bytes: None,
            lock_timeout: Some(Duration::from_secs(600)),
            lock_poll_interval: Duration::from_millis(100),
            metadata_ttl: Duration::from_secs(60),
            metadata_cache_capacity: 256,
            corrupt_retries: 1,
            write_buffer_size: 64 * 1024,
        }
    }
}

impl CacheConfig {
    /// Default configuration rooted at `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn builder() -> crate::builder::CacheConfigBuilder {
        crate::builder::CacheConfigBuilder::new()
    }
}

/// Options for the reqwest-based hub collaborator
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL of the hub
    pub endpoint: String,

    /// Overall timeout for a request; zero disables it
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Longest wait for the next bytes of a response; zero disables it.
    /// A stalled transfer fails with a transient error and can be resumed.
    pub read_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Extra headers sent with every request
    pub headers: HeaderMap,

    /// Proxy URL applied to all schemes
    pub proxy: Option<String>,

    /// Retries for metadata requests that fail transiently
    pub max_retries: u32,

    /// Base delay of the exponential backoff between retries
    pub retry_delay_base: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            proxy: None,
            max_retries: 3,
            retry_delay_base: Duration::from_millis(500),
        }
    }
}

impl HttpConfig {
    pub fn builder() -> crate::builder::HttpConfigBuilder {
        crate::builder::HttpConfigBuilder::new()
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}
