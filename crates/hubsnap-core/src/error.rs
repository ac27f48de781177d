use std::{io, path::PathBuf, time::Duration};

use hubsnap_store::FetchError;

use crate::{config::ConfigError, hub::DEFAULT_REVISION};

/// The metadata service could not turn a repository + revision into a
/// content id and manifest.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("failed to build metadata http client")]
    Client(#[source] reqwest::Error),
    #[error(
        "repository '{repo_id}' not found at revision '{}'",
        .revision.as_deref().unwrap_or(DEFAULT_REVISION)
    )]
    NotFound {
        repo_id: String,
        revision: Option<String>,
    },
    #[error("metadata request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("metadata request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("malformed metadata from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
    #[error("manifest entry '{path}' is not a safe relative path")]
    UnsafeEntry { path: String },
}

/// Failure of one snapshot resolution, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("invalid repository id '{repo_id}': {reason}")]
    InvalidIdentifier {
        repo_id: String,
        reason: &'static str,
    },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("failed to create snapshot directory {}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to fetch '{relative_path}' from {url}")]
    Fetch {
        url: String,
        relative_path: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to initialize the download client")]
    Setup(#[source] FetchError),
    #[error("failed to start the download worker pool")]
    WorkerPool(#[source] rayon::ThreadPoolBuildError),
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("snapshot of '{repo_id}' was cancelled")]
    Cancelled { repo_id: String },
    #[error("snapshot of '{repo_id}' did not finish within {}s", timeout.as_secs())]
    TimedOut { repo_id: String, timeout: Duration },
}

impl SnapshotError {
    /// Whether the failure is attributable to the caller's input.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentifier { .. }
                | Self::Config(_)
                | Self::Resolution(ResolutionError::NotFound { .. })
        )
    }

    /// Stable machine-readable tag for JSON output.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::Resolution(ResolutionError::NotFound { .. }) => "not_found",
            Self::Resolution(_) => "resolution_failed",
            Self::Storage { .. } => "storage_failed",
            Self::Fetch { .. } | Self::Setup(_) => "fetch_failed",
            Self::WorkerPool(_) => "setup_failed",
            Self::Cancelled { .. } => "cancelled",
            Self::TimedOut { .. } => "timed_out",
            Self::Config(_) => "invalid_config",
        }
    }
}
