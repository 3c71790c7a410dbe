use std::sync::Arc;

use clap::Parser;
use hubcache::{DownloadEvent, HubCache};
use indicatif::MultiProgress;
use tracing::{debug, error};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod cli;
mod commands;
mod config;
mod error;
mod utils;

use cli::{Args, Commands};
use commands::CommandExecutor;
use config::AppConfig;
use error::{AppError, Result};
use utils::parse_size;
use utils::progress::ProgressManager;

fn main() {
    if let Err(e) = bootstrap() {
        error!(error = ?e, "Application failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet)?;

    if let Commands::Config { show, reset } = &args.command {
        if *reset {
            let path = AppConfig::reset(args.config.as_deref())?;
            println!("Configuration reset to defaults at {}", path.display());
        } else if *show {
            let config = AppConfig::load(args.config.as_deref())?;
            println!("{}", config.show()?);
        } else {
            println!("Use --show to display current configuration or --reset to reset to defaults");
        }
        return Ok(());
    }

    let config = AppConfig::load(args.config.as_deref())?;
    let (cache_config, http_config) = config.resolve(&args)?;
    debug!(?cache_config, endpoint = %http_config.endpoint, "Resolved configuration");

    let mut cache = HubCache::with_http(cache_config, http_config).await?;
    if let Commands::Get { progress: true, .. } = &args.command {
        let progress_manager = ProgressManager::new(MultiProgress::new());
        cache = cache.with_event_handler(Arc::new(move |event: &DownloadEvent| {
            progress_manager.handle_event(event);
        }));
    }
    let executor = CommandExecutor::new(cache);

    match args.command {
        Commands::Get {
            repo_id,
            filenames,
            revision,
            kind,
            snapshot,
            ..
        } => {
            executor
                .get(kind, &repo_id, &revision, &filenames, snapshot)
                .await?
        }
        Commands::Stats => executor.stats().await?,
        Commands::Evict { size } => executor.evict(parse_size(&size)?).await?,
        Commands::Clear { repo, kind, all } => executor.clear(repo.as_deref(), kind, all).await?,
        Commands::Unlink {
            repo_id,
            filename,
            revision,
            kind,
        } => {
            executor
                .unlink(kind, &repo_id, &revision, &filename)
                .await?
        }
        Commands::Prune => executor.prune().await?,
        Commands::Rebuild => executor.rebuild().await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(verbose)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()
        .map_err(|e| AppError::Initialization(e.to_string()))
}
