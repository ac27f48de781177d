//! Repository identifiers, content ids, and the on-disk snapshot layout.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Serialize;

use crate::SnapshotError;

/// Replaces `/` when a repository id is flattened into one path segment.
/// Hub repository names may not contain it, so flattening cannot collide.
pub const REPO_ID_SEPARATOR: &str = "__";

/// Validated `owner/name` (or bare `name`) repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    /// Validate a raw repository id.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InvalidIdentifier`] when the id is empty,
    /// has more than one `/`, contains empty, `.` or `..` segments,
    /// backslashes or whitespace, or contains [`REPO_ID_SEPARATOR`].
    pub fn parse(raw: &str) -> Result<Self, SnapshotError> {
        let invalid = |reason| SnapshotError::InvalidIdentifier {
            repo_id: raw.to_string(),
            reason,
        };
        if raw.is_empty() {
            return Err(invalid("repository id is empty"));
        }
        if raw.contains(REPO_ID_SEPARATOR) {
            return Err(invalid("repository id must not contain '__'"));
        }
        if raw.contains('\\') || raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid(
                "repository id must not contain backslashes or whitespace",
            ));
        }
        if raw.matches('/').count() > 1 {
            return Err(invalid("repository id must look like 'owner/name'"));
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid("repository id has an empty or relative segment"));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the id (`owner`, `name`).
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Single path segment form: `owner/name` becomes `owner__name`.
    #[must_use]
    pub fn flatten(&self) -> String {
        self.0.replace('/', REPO_ID_SEPARATOR)
    }
}

impl FromStr for RepoId {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable identifier of a resolved repository state (the commit sha).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Validate a content id returned by the metadata service.
    ///
    /// Only ASCII alphanumerics, `-` and `_` are accepted so the id is
    /// always the unambiguous suffix of a storage folder name.
    ///
    /// # Errors
    ///
    /// Returns a static reason when the id is empty, has other characters,
    /// or contains [`REPO_ID_SEPARATOR`].
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        if raw.is_empty() {
            return Err("content id is empty");
        }
        if raw.contains(REPO_ID_SEPARATOR) {
            return Err("content id must not contain '__'");
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err("content id has characters outside [A-Za-z0-9_-]");
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Folder holding the snapshot of `repo_id` at `content_id`.
///
/// Pure: `cache_root/<flattened repo id>.<content id>`, no filesystem access.
#[must_use]
pub fn storage_folder(cache_root: &Path, repo_id: &RepoId, content_id: &ContentId) -> PathBuf {
    cache_root.join(storage_folder_name(repo_id, content_id))
}

#[must_use]
pub fn storage_folder_name(repo_id: &RepoId, content_id: &ContentId) -> String {
    format!("{}.{}", repo_id.flatten(), content_id)
}

/// Recover the repository id and content id from a storage folder name.
///
/// Returns `None` for names this crate would not have produced.
#[must_use]
pub fn parse_storage_folder_name(name: &str) -> Option<(RepoId, ContentId)> {
    let (flat, content) = name.rsplit_once('.')?;
    let content_id = ContentId::parse(content).ok()?;
    let repo_id = unflatten(flat)?;
    Some((repo_id, content_id))
}

/// Inverse of [`RepoId::flatten`].
///
/// Every `__` position is tried, overlapping ones included, since an owner
/// may end and a name may start with `_`. The first split that parses and
/// flattens back to `flat` wins.
fn unflatten(flat: &str) -> Option<RepoId> {
    if !flat.contains(REPO_ID_SEPARATOR) {
        return RepoId::parse(flat).ok();
    }
    (0..flat.len())
        .filter(|&at| flat.is_char_boundary(at) && flat[at..].starts_with(REPO_ID_SEPARATOR))
        .filter_map(|at| {
            let candidate = format!(
                "{}/{}",
                &flat[..at],
                &flat[at + REPO_ID_SEPARATOR.len()..]
            );
            RepoId::parse(&candidate).ok()
        })
        .find(|repo_id| repo_id.flatten() == flat)
}
