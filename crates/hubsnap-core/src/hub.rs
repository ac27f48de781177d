//! Hub collaborators: repository metadata and file URLs.

use std::{path::PathBuf, time::Duration};

use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::{
    repo::{ContentId, RepoId},
    ResolutionError,
};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";
const USER_AGENT: &str = concat!("hubsnap/", env!("CARGO_PKG_VERSION"));

/// Base URL of a hub. Always usable as a base for path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint(Url);

impl Endpoint {
    /// Parse an `http(s)` base URL.
    ///
    /// # Errors
    ///
    /// Returns a reason when the value is not an absolute http(s) URL.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw.trim_end_matches('/')).map_err(|err| err.to_string())?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(format!("'{raw}' is not an http(s) base URL"));
        }
        Ok(Self(url))
    }

    #[must_use]
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    /// Download URL of `filename` in `repo_id` at `revision`:
    /// `{endpoint}/{repo_id}/resolve/{revision}/{filename}`.
    ///
    /// Every segment is percent-encoded; `/` inside `filename` stays a
    /// separator while `/` inside `revision` is encoded.
    #[must_use]
    pub fn file_url(&self, repo_id: &RepoId, filename: &str, revision: &str) -> Url {
        self.with_segments(
            repo_id
                .segments()
                .chain(["resolve", revision])
                .chain(filename.split('/')),
        )
    }

    /// Metadata URL of `repo_id`, pinned to `revision` when given.
    #[must_use]
    pub fn model_info_url(&self, repo_id: &RepoId, revision: Option<&str>) -> Url {
        let base = ["api", "models"].into_iter().chain(repo_id.segments());
        match revision {
            Some(revision) => self.with_segments(base.chain(["revision", revision])),
            None => self.with_segments(base),
        }
    }

    fn with_segments<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.0.clone();
        // `parse` rejects cannot-be-a-base URLs, so this always succeeds.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Free-function form of [`Endpoint::file_url`].
#[must_use]
pub fn hub_file_url(
    endpoint: &Endpoint,
    repo_id: &RepoId,
    filename: &str,
    revision: &str,
) -> Url {
    endpoint.file_url(repo_id, filename, revision)
}

/// Relative POSIX path of one file in a resolved repository state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestEntry(String);

impl ManifestEntry {
    /// Validate a manifest path.
    ///
    /// # Errors
    ///
    /// Rejects absolute paths and paths with empty, `.` or `..` segments,
    /// which could escape the snapshot folder.
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        let unsafe_entry = || ResolutionError::UnsafeEntry {
            path: raw.to_string(),
        };
        if raw.is_empty() || raw.contains('\\') {
            return Err(unsafe_entry());
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(unsafe_entry());
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The entry rejoined with the platform's path separator.
    #[must_use]
    pub fn local_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

/// Content id and file list of a resolved repository revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    pub content_id: ContentId,
    pub entries: Vec<ManifestEntry>,
}

/// Resolves a repository revision to its immutable content id and files.
pub trait MetadataSource: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] for unknown repositories or revisions,
    /// transport failures, and malformed responses.
    fn resolve(
        &self,
        repo_id: &RepoId,
        revision: Option<&str>,
    ) -> Result<ResolvedManifest, ResolutionError>;
}

impl<T: MetadataSource + ?Sized> MetadataSource for &T {
    fn resolve(
        &self,
        repo_id: &RepoId,
        revision: Option<&str>,
    ) -> Result<ResolvedManifest, ResolutionError> {
        (**self).resolve(repo_id, revision)
    }
}

#[derive(Deserialize)]
struct ModelInfo {
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Deserialize)]
struct Sibling {
    rfilename: String,
}

/// [`MetadataSource`] backed by the hub's model info API.
#[derive(Debug, Clone)]
pub struct HubApi {
    client: Client,
    endpoint: Endpoint,
}

impl HubApi {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, ResolutionError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(ResolutionError::Client)?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl MetadataSource for HubApi {
    fn resolve(
        &self,
        repo_id: &RepoId,
        revision: Option<&str>,
    ) -> Result<ResolvedManifest, ResolutionError> {
        let url = self.endpoint.model_info_url(repo_id, revision);
        debug!(
            %repo_id,
            revision = revision.unwrap_or(DEFAULT_REVISION),
            %url,
            "resolving revision"
        );
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|source| ResolutionError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ResolutionError::NotFound {
                repo_id: repo_id.to_string(),
                revision: revision.map(ToOwned::to_owned),
            });
        }
        if !status.is_success() {
            return Err(ResolutionError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let malformed = |reason: String| ResolutionError::MalformedResponse {
            url: url.to_string(),
            reason,
        };
        let info: ModelInfo = response.json().map_err(|err| malformed(err.to_string()))?;
        let sha = info
            .sha
            .ok_or_else(|| malformed("response has no 'sha'".to_string()))?;
        let content_id = ContentId::parse(&sha).map_err(|reason| malformed(reason.to_string()))?;
        let entries = info
            .siblings
            .iter()
            .map(|sibling| ManifestEntry::parse(&sibling.rfilename))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedManifest {
            content_id,
            entries,
        })
    }
}
