use std::{io, path::PathBuf};

/// Failure to materialize a single file in the cache.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to build http client")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("stream error while downloading {url}")]
    Stream {
        url: String,
        #[source]
        source: io::Error,
    },
    #[error("truncated download from {url} (expected {expected} bytes, got {actual})")]
    Truncated {
        url: String,
        expected: u64,
        actual: u64,
    },
    #[error("{url} did not return an ETag; cannot derive a cache name")]
    MissingEtag { url: String },
    #[error("{url} is unreachable and no cached copy exists")]
    Offline { url: String },
    #[error("failed to lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("filesystem error at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether another attempt at the same transfer could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Stream { .. } | Self::Truncated { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Client(_)
            | Self::MissingEtag { .. }
            | Self::Offline { .. }
            | Self::Lock { .. }
            | Self::Io { .. } => false,
        }
    }
}
