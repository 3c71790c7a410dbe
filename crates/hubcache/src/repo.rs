//! # Repository coordinates
//!
//! Types naming a file inside a hub repository at a given revision.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Kind of hub repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Model,
    Dataset,
    Space,
}

impl RepoKind {
    /// Directory name used under `snapshots/`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
            Self::Space => "space",
        }
    }

    /// Plural path segment used by the hub API (`/api/models/...`)
    pub fn api_segment(&self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
            Self::Space => "spaces",
        }
    }

    /// Prefix used by the hub's resolve URLs; models have none
    pub fn url_prefix(&self) -> &'static str {
        match self {
            Self::Model => "",
            Self::Dataset => "datasets/",
            Self::Space => "spaces/",
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Model, Self::Dataset, Self::Space]
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepoKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "model" | "models" => Ok(Self::Model),
            "dataset" | "datasets" => Ok(Self::Dataset),
            "space" | "spaces" => Ok(Self::Space),
            other => Err(CacheError::InvalidArgument(format!(
                "unknown repository kind '{other}'"
            ))),
        }
    }
}

/// A named file at a revision of a repository.
///
/// This is the key of a snapshot reference: two `FileRef`s that differ in any
/// field are different references, even when they resolve to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileRef {
    pub kind: RepoKind,
    pub repo_id: String,
    pub revision: String,
    pub filename: String,
}

impl FileRef {
    pub fn new(
        kind: RepoKind,
        repo_id: impl Into<String>,
        revision: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            repo_id: repo_id.into(),
            revision: revision.into(),
            filename: filename.into(),
        }
    }

    /// Shorthand for a model file
    pub fn model(
        repo_id: impl Into<String>,
        revision: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self::new(RepoKind::Model, repo_id, revision, filename)
    }

    /// Reject coordinates that cannot be mapped safely onto the cache layout
    pub fn validate(&self) -> CacheResult<()> {
        if self.repo_id.is_empty() {
            return Err(invalid("repository id is empty"));
        }
        if self.repo_id.matches('/').count() > 1 {
            return Err(invalid(format!(
                "repository id '{}' has more than one '/'",
                self.repo_id
            )));
        }
        check_components("repository id", &self.repo_id)?;
        check_no_separator("repository id", &self.repo_id)?;

        if self.revision.is_empty() {
            return Err(invalid("revision is empty"));
        }
        check_components("revision", &self.revision)?;
        check_no_separator("revision", &self.revision)?;

        if self.filename.is_empty() {
            return Err(invalid("filename is empty"));
        }
        if self.filename.starts_with('/') {
            return Err(invalid(format!(
                "filename '{}' must be relative",
                self.filename
            )));
        }
        check_components("filename", &self.filename)?;
        Ok(())
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}/{}",
            self.kind, self.repo_id, self.revision, self.filename
        )
    }
}

fn invalid(msg: impl Into<String>) -> CacheError {
    CacheError::InvalidArgument(msg.into())
}

// `--` encodes `/` in snapshot directory names
fn check_no_separator(what: &str, value: &str) -> CacheResult<()> {
    if value.contains("--") {
        return Err(invalid(format!("{what} '{value}' must not contain '--'")));
    }
    Ok(())
}

fn check_components(what: &str, value: &str) -> CacheResult<()> {
    if value.contains('\\') || value.contains('\0') {
        return Err(invalid(format!("{what} '{value}' contains a forbidden character")));
    }
    for part in value.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(invalid(format!(
                "{what} '{value}' has an empty or relative path component"
            )));
        }
    }
    Ok(())
}
