//! Process configuration assembled from environment variables.

use std::{
    collections::HashMap,
    env, io,
    path::{Path, PathBuf},
    time::Duration,
};

use dirs_next::home_dir;

use crate::hub::{Endpoint, DEFAULT_ENDPOINT};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is not a valid hub endpoint: {reason}")]
    InvalidEndpoint { key: &'static str, reason: String },
    #[error("{key} must be a positive integer (got '{value}')")]
    InvalidNumber { key: &'static str, value: String },
    #[error("unable to determine home directory for the default cache")]
    NoHomeDir,
    #[error("unable to determine current directory")]
    CurrentDir(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Where snapshots are stored and which setting chose the location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    pub path: PathBuf,
    pub source: &'static str,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) cache: CacheLocation,
    pub(crate) endpoint: Endpoint,
    pub(crate) http_timeout: Duration,
    pub(crate) jobs: usize,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if a variable is malformed or the cache root cannot
    /// be resolved.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_snapshot(&EnvSnapshot::capture(), home_dir())
    }

    pub(crate) fn from_snapshot(
        snapshot: &EnvSnapshot,
        home: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let endpoint_raw = snapshot.var("HF_ENDPOINT").unwrap_or(DEFAULT_ENDPOINT);
        let endpoint =
            Endpoint::parse(endpoint_raw).map_err(|reason| ConfigError::InvalidEndpoint {
                key: "HF_ENDPOINT",
                reason,
            })?;
        Ok(Self {
            cache: resolve_cache_root(snapshot, home)?,
            endpoint,
            http_timeout: positive_number(snapshot, "HUBSNAP_HTTP_TIMEOUT")?
                .map_or(DEFAULT_HTTP_TIMEOUT, Duration::from_secs),
            jobs: positive_number(snapshot, "HUBSNAP_JOBS")?
                .and_then(|jobs| usize::try_from(jobs).ok())
                .unwrap_or(1),
        })
    }

    #[must_use]
    pub fn cache(&self) -> &CacheLocation {
        &self.cache
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    #[must_use]
    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Replace the cache root, e.g. from a `--cache-dir` argument.
    ///
    /// # Errors
    /// Returns an error if a relative path cannot be made absolute.
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        self.cache = CacheLocation {
            path: absolutize(path.into())?,
            source: "--cache-dir",
        };
        Ok(self)
    }
}

/// Determine the snapshot cache root.
///
/// Precedence: `HUBSNAP_CACHE`, `HUGGINGFACE_HUB_CACHE`, `$HF_HOME/hub`,
/// `$XDG_CACHE_HOME/huggingface/hub`, then `~/.cache/huggingface/hub`.
pub(crate) fn resolve_cache_root(
    snapshot: &EnvSnapshot,
    home: Option<PathBuf>,
) -> Result<CacheLocation, ConfigError> {
    for key in ["HUBSNAP_CACHE", "HUGGINGFACE_HUB_CACHE"] {
        if let Some(path) = snapshot.var(key) {
            return Ok(CacheLocation {
                path: absolutize(PathBuf::from(path))?,
                source: key,
            });
        }
    }
    if let Some(hf_home) = snapshot.var("HF_HOME") {
        return Ok(CacheLocation {
            path: absolutize(Path::new(hf_home).join("hub"))?,
            source: "HF_HOME",
        });
    }
    if let Some(xdg) = snapshot.var("XDG_CACHE_HOME") {
        return Ok(CacheLocation {
            path: absolutize(Path::new(xdg).join("huggingface").join("hub"))?,
            source: "XDG_CACHE_HOME",
        });
    }
    let home = home.ok_or(ConfigError::NoHomeDir)?;
    Ok(CacheLocation {
        path: home.join(".cache").join("huggingface").join("hub"),
        source: "~/.cache",
    })
}

fn positive_number(
    snapshot: &EnvSnapshot,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = snapshot.var(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: raw.to_string(),
        }),
    }
}

fn absolutize(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(env::current_dir().map_err(ConfigError::CurrentDir)?.join(path))
    }
}
