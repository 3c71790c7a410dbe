use hubcache::{CacheConfig, DEFAULT_ENDPOINT, HttpConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::utils::{parse_headers, parse_size};

const APP_NAME: &str = "hubcache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache root directory
    pub cache_dir: Option<PathBuf>,

    /// Hub base URL
    pub endpoint: String,

    /// Access token sent as a bearer token
    pub token: Option<String>,

    /// Cache size budget, e.g. "50GB"
    pub max_size: Option<String>,

    /// Seconds to wait for a concurrent fetch of the same file, 0 to wait forever
    pub lock_timeout: u64,

    /// Seconds a revision's file listing is reused
    pub metadata_ttl: u64,

    /// Overall request timeout in seconds, 0 for none
    pub timeout: u64,

    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Seconds without response bytes before a transfer is abandoned, 0 for none
    pub read_timeout: u64,

    /// Retries for transient metadata request failures
    pub max_retries: u32,

    /// User agent string for requests
    pub user_agent: Option<String>,

    /// Default proxy URL (supports http, https, socks5)
    pub proxy: Option<String>,

    /// Extra headers, "Name: Value"
    pub headers: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            max_size: None,
            lock_timeout: 600,
            metadata_ttl: 60,
            timeout: 0,
            connect_timeout: 10,
            read_timeout: 30,
            max_retries: 3,
            user_agent: None,
            proxy: None,
            headers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the given file, or from the default location
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&content)?)
            }
            Some(_) => Ok(Self::default()),
            None => Ok(confy::load(APP_NAME, None)?),
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        confy::get_configuration_file_path(APP_NAME, None).ok()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reset configuration to defaults and save
    pub fn reset(config_path: Option<&Path>) -> Result<PathBuf> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(Self::default_config_path)
            .ok_or_else(|| AppError::Config("No configuration path available".to_string()))?;
        Self::default().save(&path)?;
        Ok(path)
    }

    pub fn show(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Combine file settings with command-line flags; flags win
    pub fn resolve(&self, args: &Args) -> Result<(CacheConfig, HttpConfig)> {
        let cache_dir = args
            .cache_dir
            .clone()
            .or_else(|| self.cache_dir.clone())
            .unwrap_or_else(default_cache_dir);

        let max_size = match args.max_size.as_deref().or(self.max_size.as_deref()) {
            Some(size) => match parse_size(size)? {
                0 => None,
                bytes => Some(bytes),
            },
            None => None,
        };
        let lock_timeout = match args.lock_timeout.unwrap_or(self.lock_timeout) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let mut cache = CacheConfig::builder()
            .with_cache_dir(cache_dir)
            .with_lock_timeout(lock_timeout)
            .with_metadata_ttl(Duration::from_secs(self.metadata_ttl));
        if let Some(max_size) = max_size {
            cache = cache.with_max_size(max_size);
        }

        let endpoint = args.endpoint.as_deref().unwrap_or(&self.endpoint);
        if endpoint.is_empty() {
            return Err(AppError::InvalidInput("endpoint must not be empty".to_string()));
        }
        let mut http = HttpConfig::builder()
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_secs(args.timeout.unwrap_or(self.timeout)))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_read_timeout(Duration::from_secs(self.read_timeout))
            .with_max_retries(self.max_retries);
        if let Some(user_agent) = &self.user_agent {
            http = http.with_user_agent(user_agent);
        }
        if let Some(proxy) = args.proxy.as_ref().or(self.proxy.as_ref()) {
            http = http.with_proxy(proxy);
        }
        if let Some(token) = args.token.as_ref().or(self.token.as_ref()) {
            http = http.with_header("authorization", format!("Bearer {token}"));
        }
        let headers: Vec<String> = self.headers.iter().chain(&args.headers).cloned().collect();
        for (name, value) in parse_headers(&headers) {
            http = http.with_header(name, value);
        }

        Ok((cache.build(), http.build()))
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".cache").join(APP_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}
