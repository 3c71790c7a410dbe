use clap::{Parser, Subcommand};
use hubcache::RepoKind;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "hubcache",
    version,
    about = "Content-addressed local cache for model hub files",
    long_about = "Download files from a model hub into a shared, content-addressed local cache.\n\
                  Identical content is stored once, interrupted downloads resume, and\n\
                  concurrent invocations on the same cache directory share downloads."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache root directory
    #[arg(long, global = true, env = "HUBCACHE_HOME")]
    pub cache_dir: Option<PathBuf>,

    /// Hub base URL
    #[arg(long, global = true, env = "HUBCACHE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Access token sent as a bearer token
    #[arg(long, global = true, env = "HUBCACHE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Cache size budget with optional unit (B, KB, MB, GB, TB). Examples: "50GB", "500MB"
    #[arg(long, global = true)]
    pub max_size: Option<String>,

    /// Overall request timeout in seconds, 0 for none
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Seconds to wait for another process fetching the same file, 0 to wait forever
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    /// Proxy URL (supports http, https, socks5)
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'
    #[arg(long = "header", short = 'H', global = true, value_name = "HEADER")]
    pub headers: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Make files present in the cache and print their local paths
    Get {
        /// Repository id, e.g. "openai-community/gpt2"
        repo_id: String,

        /// Files inside the repository
        #[arg(required = true)]
        filenames: Vec<String>,

        /// Branch, tag or commit
        #[arg(short, long, default_value = "main")]
        revision: String,

        /// Repository kind (model, dataset, space)
        #[arg(short, long, default_value = "model")]
        kind: RepoKind,

        /// Print snapshot paths instead of blob paths
        #[arg(long)]
        snapshot: bool,

        /// Show progress bars
        #[arg(short = 'P', long)]
        progress: bool,
    },

    /// Show cache usage per repository
    Stats,

    /// Free space by removing unreferenced content, least recently used first
    Evict {
        /// Amount to free with optional unit, e.g. "10GB"
        size: String,
    },

    /// Remove cached files
    Clear {
        /// Only files of this repository
        #[arg(long)]
        repo: Option<String>,

        /// Only files of this repository kind
        #[arg(short, long)]
        kind: Option<RepoKind>,

        /// Required to clear the whole cache
        #[arg(long, conflicts_with_all = ["repo", "kind"])]
        all: bool,
    },

    /// Forget one cached file; its content stays until evicted
    Unlink {
        repo_id: String,
        filename: String,

        #[arg(short, long, default_value = "main")]
        revision: String,

        #[arg(short, long, default_value = "model")]
        kind: RepoKind,
    },

    /// Delete interrupted downloads that nothing is resuming
    Prune,

    /// Scan the cache directory again and report what it holds
    Rebuild,

    /// Configuration management
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
    },
}
