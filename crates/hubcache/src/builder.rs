//! # Configuration builders
//!
//! Fluent builders for [`CacheConfig`] and [`HttpConfig`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use hubcache::{CacheConfig, HttpConfig};
//!
//! let cache = CacheConfig::builder()
//!     .with_cache_dir("/var/cache/hub")
//!     .with_max_size(10 * 1024 * 1024 * 1024)
//!     .with_lock_timeout(Some(Duration::from_secs(120)))
//!     .build();
//!
//! let http = HttpConfig::builder()
//!     .with_endpoint("https://hub.example.com")
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_header("X-Request-Source", "batch")
//!     .build();
//! # let _ = (cache, http);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::{CacheConfig, HttpConfig};

/// Builder for [`CacheConfig`]
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = cache_dir.into();
        self
    }

    /// Set the size budget; zero removes it
    pub fn with_max_size(mut self, max_size_bytes: u64) -> Self {
        self.config.max_size_bytes = (max_size_bytes > 0).then_some(max_size_bytes);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.config.lock_poll_interval = interval;
        self
    }

    pub fn with_metadata_ttl(mut self, ttl: Duration) -> Self {
        self.config.metadata_ttl = ttl;
        self
    }

    pub fn with_corrupt_retries(mut self, retries: u32) -> Self {
        self.config.corrupt_retries = retries;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size.max(4096);
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`HttpConfig`]
#[derive(Debug, Clone)]
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HttpConfig::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a header; invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Replace all headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn with_retry_delay_base(mut self, delay: Duration) -> Self {
        self.config.retry_delay_base = delay;
        self
    }

    pub fn build(self) -> HttpConfig {
        self.config
    }
}

impl Default for HttpConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
