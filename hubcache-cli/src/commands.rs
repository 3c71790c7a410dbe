use hubcache::{FileRef, HttpRemote, HubCache, RepoKind};
use std::time::{Duration, SystemTime};
use tracing::info;

use crate::error::{AppError, Result};
use crate::utils::format_bytes;

pub struct CommandExecutor {
    cache: HubCache<HttpRemote>,
}

impl CommandExecutor {
    pub fn new(cache: HubCache<HttpRemote>) -> Self {
        Self { cache }
    }

    /// Ensure every file is present, printing one local path per line
    pub async fn get(
        &self,
        kind: RepoKind,
        repo_id: &str,
        revision: &str,
        filenames: &[String],
        snapshot: bool,
    ) -> Result<()> {
        for filename in filenames {
            let file = FileRef::new(kind, repo_id, revision, filename.as_str());
            let blob = self.cache.ensure_present(&file).await?;
            let path = if snapshot {
                self.cache.snapshot_path(&file)?
            } else {
                blob
            };
            println!("{}", path.display());
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<()> {
        let stats = self.cache.stats().await?;

        println!("Cache directory:   {}", self.cache.config().cache_dir.display());
        println!("Total size:        {}", format_bytes(stats.total_size_bytes));
        if let Some(budget) = self.cache.config().max_size_bytes {
            println!("Size budget:       {}", format_bytes(budget));
        }
        println!(
            "Blobs:             {} ({} unreferenced)",
            stats.entry_count, stats.orphan_count
        );
        println!("Partial downloads: {}", stats.partial_count);

        if stats.repos.is_empty() {
            return Ok(());
        }
        println!();
        println!(
            "{:<8} {:<48} {:>12} {:>6} {:>10}  REVISIONS",
            "KIND", "REPO ID", "SIZE", "FILES", "LAST USED"
        );
        for repo in &stats.repos {
            let revisions: Vec<&str> = repo.revisions.iter().map(String::as_str).collect();
            println!(
                "{:<8} {:<48} {:>12} {:>6} {:>10}  {}",
                repo.kind.as_str(),
                repo.repo_id,
                format_bytes(repo.size_on_disk),
                repo.nb_files,
                repo.last_accessed_at.map(format_age).unwrap_or_else(|| "-".to_string()),
                revisions.join(", ")
            );
        }
        Ok(())
    }

    pub async fn evict(&self, target_bytes: u64) -> Result<()> {
        let freed = self.cache.evict(target_bytes).await?;
        println!("Freed {}", format_bytes(freed));
        Ok(())
    }

    pub async fn clear(&self, repo_id: Option<&str>, kind: Option<RepoKind>, all: bool) -> Result<()> {
        if repo_id.is_none() && kind.is_none() && !all {
            return Err(AppError::InvalidInput(
                "refusing to clear the whole cache without --all".to_string(),
            ));
        }
        let removed = self.cache.clear(repo_id, kind).await?;
        println!("Removed {removed} cached file(s)");
        Ok(())
    }

    pub async fn unlink(&self, kind: RepoKind, repo_id: &str, revision: &str, filename: &str) -> Result<()> {
        let file = FileRef::new(kind, repo_id, revision, filename);
        if self.cache.unlink(&file).await? {
            println!("Unlinked {file}");
        } else {
            println!("{file} is not cached");
        }
        Ok(())
    }

    pub async fn prune(&self) -> Result<()> {
        let removed = self.cache.prune_partials().await?;
        println!("Removed {removed} partial download(s)");
        Ok(())
    }

    pub async fn rebuild(&self) -> Result<()> {
        let blobs = self.cache.rebuild_index().await?;
        info!(blobs, "Rebuilt cache index");
        println!("Indexed {blobs} blob(s)");
        Ok(())
    }
}

fn format_age(at: SystemTime) -> String {
    let secs = SystemTime::now()
        .duration_since(at)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    match secs {
        0..60 => format!("{secs}s ago"),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_are_compact() {
        let now = SystemTime::now();
        assert_eq!(format_age(now + Duration::from_secs(5)), "0s ago");
        assert_eq!(format_age(now - Duration::from_secs(90)), "1m ago");
        assert_eq!(format_age(now - Duration::from_secs(7200)), "2h ago");
        assert_eq!(format_age(now - Duration::from_secs(3 * 86400 + 10)), "3d ago");
    }
}
