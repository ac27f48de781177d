use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use fs4::FileExt;

use crate::FetchError;

/// Suffix of the lock file that guards a cached file while it is written.
pub const LOCK_SUFFIX: &str = ".lock";

/// Lock file associated with `path` (`<path>.lock`).
#[must_use]
pub fn lock_path(path: &Path) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(LOCK_SUFFIX);
    PathBuf::from(raw)
}

/// Exclusive advisory lock, released on drop.
///
/// The lock file itself is left in place: another process may already be
/// blocked on it, and unlinking would let a third process lock a fresh inode.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self, FetchError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| FetchError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| FetchError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
