use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use reqwest::{
    blocking::{Client, Response},
    header::{HeaderMap, ETAG},
    redirect,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{
    lock::{lock_path, FileLock, LOCK_SUFFIX},
    naming::{url_prefix, url_to_filename, META_SUFFIX},
    FetchError, FetchRequest, FileCache, DOWNLOAD_ATTEMPTS, ETAG_TIMEOUT, HTTP_TIMEOUT, USER_AGENT,
};

const LINKED_ETAG: &str = "x-linked-etag";

/// Sidecar stored next to ETag-named entries.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct EntryMetadata {
    pub(crate) url: String,
    pub(crate) etag: Option<String>,
}

enum Target {
    /// Name derived from the current ETag.
    Versioned { path: PathBuf, etag: String },
    /// Older cached version reused because the server is unreachable.
    Stale(PathBuf),
}

/// [`FileCache`] backed by plain HTTP GET requests.
#[derive(Debug, Clone)]
pub struct HttpFileCache {
    client: Client,
    head_client: Client,
    attempts: usize,
}

impl HttpFileCache {
    /// Build a cache with the default request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    /// Build a cache whose GET requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(FetchError::Client)?;
        // ETags of redirected (LFS) files are reported on the redirect itself.
        let head_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(ETAG_TIMEOUT.min(timeout))
            .redirect(redirect::Policy::none())
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            head_client,
            attempts: DOWNLOAD_ATTEMPTS,
        })
    }

    #[must_use]
    pub fn attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    fn download_with_retry(
        &self,
        url: &str,
        dest: &Path,
        timeout: Option<Duration>,
    ) -> Result<u64, FetchError> {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            match self.download_once(url, dest, timeout) {
                Ok(written) => return Ok(written),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    debug!(%url, attempt, error = %err, "download attempt failed; retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Offline {
            url: url.to_string(),
        }))
    }

    fn download_once(
        &self,
        url: &str,
        dest: &Path,
        timeout: Option<Duration>,
    ) -> Result<u64, FetchError> {
        let mut get = self.client.get(url);
        if let Some(timeout) = timeout {
            get = get.timeout(timeout);
        }
        let mut response = get
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        check_status(url, &response)?;
        let expected = response.content_length();

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(parent).map_err(|err| FetchError::io(parent, err))?;
        let written = stream_into(url, &mut response, &mut tmp)?;
        if let Some(expected) = expected {
            if expected != written {
                return Err(FetchError::Truncated {
                    url: url.to_string(),
                    expected,
                    actual: written,
                });
            }
        }

        tmp.persist(dest)
            .map_err(|err| FetchError::io(dest, err.error))?;
        Ok(written)
    }

    fn fetch_etag(&self, url: &str) -> Result<Option<String>, FetchError> {
        let response = self
            .head_client
            .head(url)
            .send()
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(etag_from_headers(response.headers()))
    }

    /// Resolve the cache name of a URL without a forced filename.
    fn content_addressed_target(&self, request: &FetchRequest<'_>) -> Result<Target, FetchError> {
        match self.fetch_etag(request.url) {
            Ok(Some(etag)) => {
                let name = url_to_filename(request.url, Some(&etag));
                Ok(Target::Versioned {
                    path: request.cache_dir.join(name),
                    etag,
                })
            }
            Ok(None) => Err(FetchError::MissingEtag {
                url: request.url.to_string(),
            }),
            Err(err @ FetchError::Transport { .. }) => {
                match newest_cached_version(request.cache_dir, request.url) {
                    Some(path) => {
                        warn!(
                            url = %request.url,
                            path = %path.display(),
                            error = %err,
                            "server unreachable; reusing cached copy"
                        );
                        Ok(Target::Stale(path))
                    }
                    None => Err(FetchError::Offline {
                        url: request.url.to_string(),
                    }),
                }
            }
            Err(err) => Err(err),
        }
    }
}

impl FileCache for HttpFileCache {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<PathBuf, FetchError> {
        let (target, etag) = match request.filename {
            Some(name) => (request.cache_dir.join(name), None),
            None => match self.content_addressed_target(request)? {
                Target::Versioned { path, etag } => (path, Some(etag)),
                Target::Stale(path) => return Ok(path),
            },
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| FetchError::io(parent, err))?;
        }
        let _lock = FileLock::acquire(&lock_path(&target))?;
        if !request.force && target.is_file() {
            debug!(url = %request.url, path = %target.display(), "cache hit");
            return Ok(target);
        }

        let written = self.download_with_retry(request.url, &target, request.timeout)?;
        debug!(url = %request.url, path = %target.display(), bytes = written, "downloaded");

        if etag.is_some() {
            write_metadata(
                &target,
                &EntryMetadata {
                    url: request.url.to_string(),
                    etag,
                },
            )?;
        }
        Ok(target)
    }
}

fn check_status(url: &str, response: &Response) -> Result<(), FetchError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

fn stream_into(
    url: &str,
    response: &mut Response,
    out: &mut NamedTempFile,
) -> Result<u64, FetchError> {
    let mut written: u64 = 0;
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = response
            .read(&mut buffer)
            .map_err(|source| FetchError::Stream {
                url: url.to_string(),
                source,
            })?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])
            .map_err(|err| FetchError::io(out.path(), err))?;
        written += read as u64;
    }
    Ok(written)
}

fn etag_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LINKED_ETAG)
        .or_else(|| headers.get(ETAG))
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

fn write_metadata(target: &Path, meta: &EntryMetadata) -> Result<(), FetchError> {
    let mut raw = target.as_os_str().to_owned();
    raw.push(META_SUFFIX);
    let path = PathBuf::from(raw);
    let body = serde_json::to_vec(meta)
        .map_err(|err| FetchError::io(&path, std::io::Error::other(err)))?;
    fs::write(&path, body).map_err(|err| FetchError::io(&path, err))
}

/// Most recently modified cached version of `url` in `cache_dir`.
fn newest_cached_version(cache_dir: &Path, url: &str) -> Option<PathBuf> {
    let prefix = url_prefix(url);
    let entries = fs::read_dir(cache_dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if !name.starts_with(&prefix)
                || name.ends_with(META_SUFFIX)
                || name.ends_with(LOCK_SUFFIX)
            {
                return None;
            }
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}
