use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::repo::{parse_storage_folder_name, ContentId, RepoId};

/// A snapshot folder found under a cache root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedSnapshot {
    pub repo_id: RepoId,
    pub content_id: ContentId,
    pub path: PathBuf,
    pub files: u64,
    pub size_bytes: u64,
}

/// List snapshot folders under `cache_root`, sorted by repository and
/// content id.
///
/// Entries whose names do not parse as storage folders are ignored, as are
/// lock files left by interrupted fetches. A missing root yields an empty
/// list.
///
/// # Errors
///
/// Returns an error if the directory tree cannot be traversed.
pub fn list_cached_snapshots(cache_root: &Path) -> io::Result<Vec<CachedSnapshot>> {
    if !cache_root.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots = Vec::new();
    for entry in fs::read_dir(cache_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some((repo_id, content_id)) = name.to_str().and_then(parse_storage_folder_name)
        else {
            continue;
        };
        let path = entry.path();
        let (files, size_bytes) = folder_usage(&path)?;
        snapshots.push(CachedSnapshot {
            repo_id,
            content_id,
            path,
            files,
            size_bytes,
        });
    }

    snapshots.sort_by(|a, b| {
        (&a.repo_id, &a.content_id).cmp(&(&b.repo_id, &b.content_id))
    });
    Ok(snapshots)
}

fn folder_usage(path: &Path) -> io::Result<(u64, u64)> {
    let mut files = 0u64;
    let mut size_bytes = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if metadata.is_file()
                && !entry
                    .file_name()
                    .to_string_lossy()
                    .ends_with(hubsnap_store::LOCK_SUFFIX)
            {
                files += 1;
                size_bytes += metadata.len();
            }
        }
    }
    Ok((files, size_bytes))
}
