//! Single-file, content-addressed download cache.
//!
//! A [`FileCache`] guarantees that the content behind a URL is fetched at
//! most once per content version and returns the local path of the cached
//! copy. [`HttpFileCache`] is the HTTP implementation used by the snapshot
//! resolver; tests substitute in-memory fakes.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

mod download;
mod error;
mod lock;
mod naming;

pub use download::HttpFileCache;
pub use error::FetchError;
pub use lock::{lock_path, LOCK_SUFFIX};
pub use naming::{url_to_filename, META_SUFFIX};

pub(crate) const USER_AGENT: &str = concat!("hubsnap-store/", env!("CARGO_PKG_VERSION"));
pub(crate) const DOWNLOAD_ATTEMPTS: usize = 3;
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const ETAG_TIMEOUT: Duration = Duration::from_secs(10);

/// A single file that should be present in the cache.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// Directory the file is cached under.
    pub cache_dir: &'a Path,
    /// Final name relative to `cache_dir`. When absent the name is derived
    /// from the URL and the server's ETag.
    pub filename: Option<&'a Path>,
    /// Re-download even if a cached copy exists.
    pub force: bool,
    /// Upper bound for each transfer, tighter than the client default.
    pub timeout: Option<Duration>,
}

impl<'a> FetchRequest<'a> {
    #[must_use]
    pub fn new(url: &'a str, cache_dir: &'a Path) -> Self {
        Self {
            url,
            cache_dir,
            filename: None,
            force: false,
            timeout: None,
        }
    }

    #[must_use]
    pub fn filename(mut self, filename: &'a Path) -> Self {
        self.filename = Some(filename);
        self
    }

    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Idempotent fetch-or-reuse of one file.
///
/// Implementations must be safe to call concurrently for the same request:
/// they are the only authority on whether a file is already materialized.
/// They may leave a lock file at [`lock_path`] of the returned path.
pub trait FileCache: Send + Sync {
    /// Ensure the content at `request.url` is cached and return its path.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] on network, storage, or integrity failure.
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<PathBuf, FetchError>;
}

impl<T: FileCache + ?Sized> FileCache for &T {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<PathBuf, FetchError> {
        (**self).fetch(request)
    }
}
