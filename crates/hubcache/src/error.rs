use std::time::Duration;

use crate::remote::RemoteError;

/// Result type used across the cache core
pub type CacheResult<T> = Result<T, CacheError>;

// Error type for cache and download operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient fetch error for {file}: {reason}")]
    TransientFetch { file: String, reason: String },

    #[error("Corrupt download for {file}: {reason}")]
    CorruptDownload { file: String, reason: String },

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Eviction freed {freed} of {requested} requested bytes, remaining entries are referenced")]
    BudgetExceeded { requested: u64, freed: u64 },

    #[error("Cache index inconsistent with disk: {0}")]
    Inconsistent(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    /// Whether retrying the same call may succeed without outside intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientFetch { .. } | Self::LockTimeout { .. } | Self::CorruptDownload { .. }
        )
    }

    /// Lift a collaborator error into the cache taxonomy for the given file
    pub(crate) fn from_remote(file: impl std::fmt::Display, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound(what) => Self::NotFound(what),
            RemoteError::Transient(reason) => Self::TransientFetch {
                file: file.to_string(),
                reason,
            },
            RemoteError::RangeNotSatisfiable => Self::TransientFetch {
                file: file.to_string(),
                reason: "range not satisfiable".to_string(),
            },
            RemoteError::Other(reason) => Self::Remote(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_their_kind() {
        let not_found = CacheError::from_remote("m/a@main:x", RemoteError::NotFound("x".into()));
        assert!(matches!(not_found, CacheError::NotFound(_)));
        assert!(!not_found.is_retryable());

        let transient =
            CacheError::from_remote("m/a@main:x", RemoteError::Transient("reset".into()));
        assert!(matches!(transient, CacheError::TransientFetch { .. }));
        assert!(transient.is_retryable());

        let refused = CacheError::from_remote("m/a@main:x", RemoteError::Other("403".into()));
        assert!(matches!(refused, CacheError::Remote(_)));
    }

    #[test]
    fn budget_error_display() {
        let err = CacheError::BudgetExceeded {
            requested: 100,
            freed: 40,
        };
        assert!(err.to_string().contains("40 of 100"));
    }
}
