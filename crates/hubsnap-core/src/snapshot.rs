//! Snapshot resolution: revision -> content id -> fully populated folder.

use std::{
    collections::HashSet,
    env, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hubsnap_store::{lock_path, FetchRequest, FileCache, HttpFileCache};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::Config,
    framework::{filter_manifest, Framework},
    hub::{Endpoint, HubApi, ManifestEntry, MetadataSource},
    repo::{storage_folder, ContentId, RepoId},
    SnapshotError,
};

/// Cooperative cancellation flag shared with a running resolution.
///
/// Checked before each file starts; fetches already in flight finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inputs of one snapshot resolution.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub repo_id: String,
    pub revision: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub framework: Option<Framework>,
    /// `None` defers to the configured default.
    pub jobs: Option<usize>,
    pub timeout: Option<Duration>,
    pub force_download: bool,
    pub cancel: Option<CancelToken>,
}

impl SnapshotRequest {
    #[must_use]
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            revision: None,
            cache_dir: None,
            framework: None,
            jobs: None,
            timeout: None,
            force_download: false,
            cancel: None,
        }
    }

    #[must_use]
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Cache root override; accepts `&str`, `String`, `&Path` or `PathBuf`.
    #[must_use]
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    #[must_use]
    pub fn framework(mut self, framework: Framework) -> Self {
        self.framework = Some(framework);
        self
    }

    /// Number of files fetched concurrently; `1` fetches sequentially.
    #[must_use]
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs.max(1));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn force_download(mut self, force: bool) -> Self {
        self.force_download = force;
        self
    }

    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A fully materialized snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub folder: PathBuf,
    pub repo_id: RepoId,
    pub content_id: ContentId,
    /// Local path of every fetched file, in manifest order.
    pub files: Vec<PathBuf>,
}

/// Drives the metadata source and file cache to build snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotResolver<M, C> {
    metadata: M,
    cache: C,
    endpoint: Endpoint,
    default_cache_root: PathBuf,
}

impl SnapshotResolver<HubApi, HttpFileCache> {
    /// Resolver backed by the real hub, configured from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if either HTTP client cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self, SnapshotError> {
        let metadata = HubApi::new(config.endpoint().clone(), config.http_timeout())?;
        let cache =
            HttpFileCache::with_timeout(config.http_timeout()).map_err(SnapshotError::Setup)?;
        Ok(Self::new(
            metadata,
            cache,
            config.endpoint().clone(),
            config.cache().path.clone(),
        ))
    }
}

impl<M: MetadataSource, C: FileCache> SnapshotResolver<M, C> {
    pub fn new(metadata: M, cache: C, endpoint: Endpoint, default_cache_root: PathBuf) -> Self {
        Self {
            metadata,
            cache,
            endpoint,
            default_cache_root,
        }
    }

    /// Resolve `request` to a complete local snapshot.
    ///
    /// Either every (filtered) manifest entry is present under the returned
    /// folder, or an error names the first stage that failed. Files fetched
    /// before a failure stay cached, so retrying the whole call is cheap.
    ///
    /// # Errors
    ///
    /// See [`SnapshotError`]: invalid ids fail before any I/O, metadata
    /// failures are returned unchanged, and the first storage or fetch
    /// failure aborts the remaining work.
    pub fn resolve(&self, request: &SnapshotRequest) -> Result<Snapshot, SnapshotError> {
        let repo_id = RepoId::parse(&request.repo_id)?;
        let cache_root = match request.cache_dir.as_deref() {
            Some(dir) if dir.is_relative() => env::current_dir()
                .map(|cwd| cwd.join(dir))
                .map_err(|source| SnapshotError::Storage {
                    path: dir.to_path_buf(),
                    source,
                })?,
            Some(dir) => dir.to_path_buf(),
            None => self.default_cache_root.clone(),
        };
        let started = Instant::now();

        let manifest = self
            .metadata
            .resolve(&repo_id, request.revision.as_deref())?;
        let folder = storage_folder(&cache_root, &repo_id, &manifest.content_id);
        let total = manifest.entries.len();
        let entries = filter_manifest(manifest.entries, request.framework);
        info!(
            %repo_id,
            content_id = %manifest.content_id,
            folder = %folder.display(),
            files = entries.len(),
            skipped = total - entries.len(),
            "resolved snapshot"
        );

        let plan = Plan {
            repo_id: &repo_id,
            content_id: &manifest.content_id,
            folder: &folder,
            force: request.force_download,
            started,
            timeout: request.timeout,
            cancel: request.cancel.as_ref(),
            lock_named: lock_named_entries(&folder, &entries),
        };
        let jobs = request.jobs.unwrap_or(1);
        let files = if jobs > 1 && entries.len() > 1 {
            self.fetch_concurrently(&plan, &entries, jobs)?
        } else {
            self.fetch_sequentially(&plan, &entries)?
        };

        Ok(Snapshot {
            folder,
            repo_id,
            content_id: manifest.content_id,
            files,
        })
    }

    fn fetch_sequentially(
        &self,
        plan: &Plan<'_>,
        entries: &[ManifestEntry],
    ) -> Result<Vec<PathBuf>, SnapshotError> {
        entries
            .iter()
            .map(|entry| {
                plan.gate()?;
                self.fetch_entry(plan, entry)
            })
            .collect()
    }

    /// Fetch on a `jobs`-wide rayon pool.
    ///
    /// After the first failure no new entry starts; the failure with the
    /// lowest manifest index wins.
    fn fetch_concurrently(
        &self,
        plan: &Plan<'_>,
        entries: &[ManifestEntry],
        jobs: usize,
    ) -> Result<Vec<PathBuf>, SnapshotError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|index| format!("hubsnap-fetch-{index}"))
            .build()
            .map_err(SnapshotError::WorkerPool)?;
        let failed = AtomicBool::new(false);

        let outcomes: Vec<Option<Result<PathBuf, SnapshotError>>> = pool.install(|| {
            entries
                .par_iter()
                .map(|entry| {
                    if failed.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = plan.gate().and_then(|()| self.fetch_entry(plan, entry));
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    Some(result)
                })
                .collect()
        });

        // A skipped entry implies a recorded failure, so this still errs.
        outcomes.into_iter().flatten().collect()
    }

    fn fetch_entry(
        &self,
        plan: &Plan<'_>,
        entry: &ManifestEntry,
    ) -> Result<PathBuf, SnapshotError> {
        // Always the resolved content id, never the requested revision.
        let url = self
            .endpoint
            .file_url(plan.repo_id, entry.as_str(), plan.content_id.as_str());
        let relative_filepath = entry.local_path();
        let target = plan.folder.join(&relative_filepath);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(|source| SnapshotError::Storage {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let mut sweep = LockSweep::new(&plan.lock_named);
        sweep.add(&target);
        // A sibling's lock may already occupy this path with an empty file.
        let force = plan.force || plan.lock_named.contains(&target);
        let mut request = FetchRequest::new(url.as_str(), plan.folder)
            .filename(&relative_filepath)
            .force(force);
        if let Some(remaining) = plan.remaining() {
            request = request.timeout(remaining);
        }
        let path = self
            .cache
            .fetch(&request)
            .map_err(|source| SnapshotError::Fetch {
                url: url.to_string(),
                relative_path: entry.as_str().to_string(),
                source,
            })?;
        if path != target {
            sweep.add(&path);
        }
        debug!(file = entry.as_str(), path = %path.display(), "snapshot file ready");
        Ok(path)
    }
}

/// Resolve a snapshot with the real hub and the process configuration.
///
/// `cache_dir` overrides the configured cache root; `revision` defaults to
/// the hub's main branch. Returns the storage folder holding every
/// requested file.
///
/// # Errors
///
/// Returns [`SnapshotError::InvalidIdentifier`] before reading any
/// configuration, [`SnapshotError::Config`] when the environment is
/// malformed, and otherwise whatever [`SnapshotResolver::resolve`] returns.
pub fn resolve_snapshot(
    repo_id: &str,
    revision: Option<&str>,
    cache_dir: Option<impl Into<PathBuf>>,
    framework: Option<Framework>,
) -> Result<PathBuf, SnapshotError> {
    RepoId::parse(repo_id)?;
    let mut request = SnapshotRequest::new(repo_id);
    request.revision = revision.map(str::to_string);
    request.cache_dir = cache_dir.map(Into::into);
    request.framework = framework;
    let config = Config::from_env()?;
    Ok(resolve_snapshot_with(&config, &request)?.folder)
}

/// Resolve a snapshot with the real hub and an explicit configuration.
///
/// # Errors
///
/// See [`SnapshotResolver::resolve`].
pub fn resolve_snapshot_with(
    config: &Config,
    request: &SnapshotRequest,
) -> Result<Snapshot, SnapshotError> {
    SnapshotResolver::from_config(config)?.resolve(&with_config_defaults(request, config))
}

fn with_config_defaults(request: &SnapshotRequest, config: &Config) -> SnapshotRequest {
    let mut request = request.clone();
    request.jobs = request.jobs.or(Some(config.jobs()));
    request
}

/// Targets whose path is also the lock file of another entry.
fn lock_named_entries(folder: &Path, entries: &[ManifestEntry]) -> HashSet<PathBuf> {
    let targets: HashSet<PathBuf> = entries
        .iter()
        .map(|entry| folder.join(entry.local_path()))
        .collect();
    targets
        .iter()
        .map(|target| lock_path(target))
        .filter(|lock| targets.contains(lock))
        .collect()
}

struct Plan<'a> {
    repo_id: &'a RepoId,
    content_id: &'a ContentId,
    folder: &'a Path,
    force: bool,
    started: Instant,
    timeout: Option<Duration>,
    cancel: Option<&'a CancelToken>,
    lock_named: HashSet<PathBuf>,
}

impl Plan<'_> {
    /// Checked before a file starts.
    fn gate(&self) -> Result<(), SnapshotError> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(SnapshotError::Cancelled {
                repo_id: self.repo_id.to_string(),
            });
        }
        if let Some(timeout) = self.timeout {
            if self.started.elapsed() >= timeout {
                return Err(SnapshotError::TimedOut {
                    repo_id: self.repo_id.to_string(),
                    timeout,
                });
            }
        }
        Ok(())
    }

    /// Time left before the deadline, if one is set.
    fn remaining(&self) -> Option<Duration> {
        self.timeout
            .map(|timeout| timeout.saturating_sub(self.started.elapsed()))
    }
}

/// Removes lock files left next to fetched files once the fetch returns.
///
/// Runs on drop, so it also fires when the fetch failed. Removal is best
/// effort: a concurrent caller may already have removed the file. Paths
/// that are themselves manifest entries are never removed.
struct LockSweep<'a> {
    keep: &'a HashSet<PathBuf>,
    locks: Vec<PathBuf>,
}

impl<'a> LockSweep<'a> {
    fn new(keep: &'a HashSet<PathBuf>) -> Self {
        Self {
            keep,
            locks: Vec::new(),
        }
    }

    fn add(&mut self, path: &Path) {
        let lock = lock_path(path);
        if !self.keep.contains(&lock) {
            self.locks.push(lock);
        }
    }
}

impl Drop for LockSweep<'_> {
    fn drop(&mut self) {
        for lock in &self.locks {
            match fs::remove_file(lock) {
                Ok(()) => debug!(path = %lock.display(), "removed stale lock file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(%err, path = %lock.display(), "could not remove lock file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{atomic::AtomicUsize, Mutex},
        thread,
    };

    use hubsnap_store::FetchError;
    use tempfile::TempDir;

    use super::*;
    use crate::{hub::ResolvedManifest, ResolutionError};

    struct FakeHub {
        content_id: &'static str,
        entries: Vec<&'static str>,
        missing: bool,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl FakeHub {
        fn new(entries: &[&'static str]) -> Self {
            Self {
                content_id: "abc123",
                entries: entries.to_vec(),
                missing: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn missing() -> Self {
            Self {
                missing: true,
                ..Self::new(&[])
            }
        }

        fn calls(&self) -> Vec<Option<String>> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl MetadataSource for FakeHub {
        fn resolve(
            &self,
            repo_id: &RepoId,
            revision: Option<&str>,
        ) -> Result<ResolvedManifest, ResolutionError> {
            self.calls
                .lock()
                .expect("calls")
                .push(revision.map(str::to_string));
            if self.missing {
                return Err(ResolutionError::NotFound {
                    repo_id: repo_id.to_string(),
                    revision: revision.map(str::to_string),
                });
            }
            Ok(ResolvedManifest {
                content_id: ContentId::parse(self.content_id).expect("content id"),
                entries: self
                    .entries
                    .iter()
                    .map(|entry| ManifestEntry::parse(entry))
                    .collect::<Result<_, _>>()?,
            })
        }
    }

    /// Writes the URL as file content and leaves a lock file behind, like the
    /// HTTP cache does.
    #[derive(Default)]
    struct FakeCache {
        fail_on: Option<&'static str>,
        /// Successful fetches wait until the failing one has returned.
        hold_until_failure: bool,
        failures: AtomicUsize,
        urls: Mutex<Vec<String>>,
        timeouts: Mutex<Vec<Option<Duration>>>,
        downloads: Mutex<HashMap<PathBuf, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeCache {
        fn failing_on(path: &'static str) -> Self {
            Self {
                fail_on: Some(path),
                ..Self::default()
            }
        }

        fn holding_until(path: &'static str) -> Self {
            Self {
                hold_until_failure: true,
                ..Self::failing_on(path)
            }
        }

        fn timeouts(&self) -> Vec<Option<Duration>> {
            self.timeouts.lock().expect("timeouts").clone()
        }

        fn wait_for_failure(&self) {
            let give_up = Instant::now() + Duration::from_secs(5);
            while self.failures.load(Ordering::SeqCst) == 0 && Instant::now() < give_up {
                thread::sleep(Duration::from_millis(1));
            }
            // Let the resolver observe the failure before this fetch returns.
            thread::sleep(Duration::from_millis(50));
        }

        fn urls(&self) -> Vec<String> {
            self.urls.lock().expect("urls").clone()
        }

        fn total_downloads(&self) -> usize {
            self.downloads.lock().expect("downloads").values().sum()
        }
    }

    impl FileCache for FakeCache {
        fn fetch(&self, request: &FetchRequest<'_>) -> Result<PathBuf, FetchError> {
            let filename = request.filename.expect("snapshot always names files");
            let target = request.cache_dir.join(filename);
            // Like the store's lock: created if absent, never truncated.
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(lock_path(&target))
                .expect("open lock");
            self.urls.lock().expect("urls").push(request.url.to_string());
            self.timeouts.lock().expect("timeouts").push(request.timeout);
            if self.fail_on.is_some_and(|fail| Path::new(fail) == filename) {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(FetchError::Status {
                    url: request.url.to_string(),
                    status: 500,
                });
            }

            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if self.hold_until_failure {
                self.wait_for_failure();
            } else {
                thread::sleep(Duration::from_millis(5));
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if target.exists() && !request.force {
                return Ok(target);
            }
            fs::write(&target, request.url).expect("write file");
            *self
                .downloads
                .lock()
                .expect("downloads")
                .entry(target.clone())
                .or_default() += 1;
            Ok(target)
        }
    }

    fn resolver<'a>(
        hub: &'a FakeHub,
        cache: &'a FakeCache,
        root: &TempDir,
    ) -> SnapshotResolver<&'a FakeHub, &'a FakeCache> {
        let endpoint = Endpoint::parse("https://hub.example").expect("endpoint");
        SnapshotResolver::new(hub, cache, endpoint, root.path().to_path_buf())
    }

    fn lock_files(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(entries) = fs::read_dir(dir) else {
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                found.extend(lock_files(&path));
            } else if path.to_string_lossy().ends_with(hubsnap_store::LOCK_SUFFIX) {
                found.push(path);
            }
        }
        found
    }

    #[test]
    fn resolves_into_content_addressed_folder() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json", "pytorch_model.bin"]);
        let cache = FakeCache::default();

        let snapshot = resolver(&hub, &cache, &root).resolve(&SnapshotRequest::new("org/model"))?;

        assert_eq!(snapshot.folder, root.path().join("org__model.abc123"));
        assert_eq!(snapshot.content_id.as_str(), "abc123");
        assert!(snapshot.folder.join("config.json").is_file());
        assert!(snapshot.folder.join("pytorch_model.bin").is_file());
        assert_eq!(
            snapshot.files,
            [
                snapshot.folder.join("config.json"),
                snapshot.folder.join("pytorch_model.bin"),
            ]
        );
        assert!(lock_files(root.path()).is_empty());
        Ok(())
    }

    #[test]
    fn files_are_fetched_at_the_content_id_not_the_revision() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json"]);
        let cache = FakeCache::default();

        resolver(&hub, &cache, &root).resolve(&SnapshotRequest::new("org/model").revision("v2"))?;

        assert_eq!(hub.calls(), [Some("v2".to_string())]);
        assert_eq!(
            cache.urls(),
            ["https://hub.example/org/model/resolve/abc123/config.json"]
        );
        Ok(())
    }

    #[test]
    fn second_resolution_reuses_cached_files() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json", "tokenizer.json"]);
        let cache = FakeCache::default();
        let resolver = resolver(&hub, &cache, &root);
        let request = SnapshotRequest::new("org/model");

        let first = resolver.resolve(&request)?;
        let second = resolver.resolve(&request)?;

        assert_eq!(first, second);
        assert_eq!(cache.total_downloads(), 2);

        resolver.resolve(&request.clone().force_download(true))?;
        assert_eq!(cache.total_downloads(), 4);
        Ok(())
    }

    #[test]
    fn framework_filter_limits_fetched_files() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&[
            "config.json",
            "pytorch_model.bin",
            "tf_model.h5",
            "flax_model.msgpack",
        ]);
        let cache = FakeCache::default();

        let snapshot = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/model").framework(Framework::Pytorch))?;

        assert_eq!(cache.urls().len(), 2);
        assert!(snapshot.folder.join("pytorch_model.bin").is_file());
        assert!(!snapshot.folder.join("tf_model.h5").exists());
        assert!(!snapshot.folder.join("flax_model.msgpack").exists());
        Ok(())
    }

    #[test]
    fn nested_entries_get_their_directories() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["subdir/weights.bin", "a/b/c.txt"]);
        let cache = FakeCache::default();

        let snapshot = resolver(&hub, &cache, &root).resolve(&SnapshotRequest::new("org/model"))?;

        assert!(snapshot.folder.join("subdir").join("weights.bin").is_file());
        assert!(snapshot.folder.join("a/b/c.txt").is_file());
        assert!(lock_files(root.path()).is_empty());
        Ok(())
    }

    #[test]
    fn request_cache_dir_overrides_default_root() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let other = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json"]);
        let cache = FakeCache::default();

        let snapshot = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("solo").cache_dir(other.path()))?;

        assert_eq!(snapshot.folder, other.path().join("solo.abc123"));
        assert_eq!(fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn invalid_identifier_fails_before_any_io() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json"]);
        let cache = FakeCache::default();

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org__model"))
            .expect_err("separator in id");

        assert!(matches!(err, SnapshotError::InvalidIdentifier { .. }));
        assert!(hub.calls().is_empty());
        assert!(cache.urls().is_empty());
        assert_eq!(fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn resolution_failure_touches_nothing() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::missing();
        let cache = FakeCache::default();

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/missing").revision("v9"))
            .expect_err("missing repo");

        assert!(matches!(
            err,
            SnapshotError::Resolution(ResolutionError::NotFound { .. })
        ));
        assert!(err.is_user_error());
        assert!(cache.urls().is_empty());
        assert_eq!(fs::read_dir(root.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn first_fetch_failure_aborts_remaining_files() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["a.bin", "b.bin", "c.bin", "d.bin", "e.bin"]);
        let cache = FakeCache::failing_on("c.bin");

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/model"))
            .expect_err("c.bin fails");

        let SnapshotError::Fetch {
            url, relative_path, ..
        } = &err
        else {
            panic!("expected fetch failure, got {err:?}");
        };
        assert_eq!(relative_path, "c.bin");
        assert!(url.ends_with("/resolve/abc123/c.bin"));

        let folder = root.path().join("org__model.abc123");
        assert!(folder.join("a.bin").is_file());
        assert!(folder.join("b.bin").is_file());
        assert!(!folder.join("d.bin").exists());
        assert_eq!(cache.urls().len(), 3);
        assert!(lock_files(root.path()).is_empty());
        Ok(())
    }

    #[test]
    fn cancelled_token_stops_before_first_file() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json", "pytorch_model.bin"]);
        let cache = FakeCache::default();
        let token = CancelToken::new();
        token.cancel();

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/model").cancel_token(token))
            .expect_err("cancelled");

        assert!(matches!(err, SnapshotError::Cancelled { .. }));
        assert_eq!(err.reason(), "cancelled");
        assert!(cache.urls().is_empty());
        Ok(())
    }

    #[test]
    fn elapsed_deadline_reports_timeout() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json"]);
        let cache = FakeCache::default();

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/model").timeout(Duration::ZERO))
            .expect_err("deadline already passed");

        assert!(matches!(err, SnapshotError::TimedOut { .. }));
        assert!(cache.urls().is_empty());
        Ok(())
    }

    #[test]
    fn concurrent_fetches_keep_manifest_order() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let names = ["f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7"];
        let hub = FakeHub::new(&names);
        let cache = FakeCache::default();

        let snapshot =
            resolver(&hub, &cache, &root).resolve(&SnapshotRequest::new("org/model").jobs(3))?;

        let expected: Vec<_> = names.iter().map(|name| snapshot.folder.join(name)).collect();
        assert_eq!(snapshot.files, expected);
        assert_eq!(cache.total_downloads(), names.len());
        assert!(cache.peak.load(Ordering::SeqCst) <= 3);
        assert!(lock_files(root.path()).is_empty());
        Ok(())
    }

    #[test]
    fn concurrent_failure_is_reported() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["a", "b", "c", "d", "e", "f"]);
        let cache = FakeCache::failing_on("b");

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/model").jobs(2))
            .expect_err("b fails");

        assert!(
            matches!(&err, SnapshotError::Fetch { relative_path, .. } if relative_path == "b"),
            "{err:?}"
        );
        Ok(())
    }

    #[test]
    fn lock_sweep_ignores_missing_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("model.bin");
        fs::write(lock_path(&target), b"")?;
        let keep = HashSet::new();
        {
            let mut sweep = LockSweep::new(&keep);
            sweep.add(&target);
            sweep.add(&dir.path().join("never-created"));
        }
        assert!(!lock_path(&target).exists());
        Ok(())
    }

    #[test]
    fn concurrent_failure_stops_new_fetches() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let names = ["f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7"];
        let hub = FakeHub::new(&names);
        let cache = FakeCache::holding_until("f0");

        let err = resolver(&hub, &cache, &root)
            .resolve(&SnapshotRequest::new("org/model").jobs(2))
            .expect_err("f0 fails");

        assert!(
            matches!(&err, SnapshotError::Fetch { relative_path, .. } if relative_path == "f0"),
            "{err:?}"
        );
        assert!(cache.urls().len() <= 2, "{:?}", cache.urls());
        assert!(lock_files(root.path()).is_empty());
        Ok(())
    }

    #[test]
    fn lock_named_entries_are_kept() -> anyhow::Result<()> {
        for (names, jobs) in [
            (["weights.bin.lock", "weights.bin"], 1),
            (["weights.bin", "weights.bin.lock"], 1),
            (["weights.bin.lock", "weights.bin"], 2),
        ] {
            let root = tempfile::tempdir()?;
            let hub = FakeHub::new(&names);
            let cache = FakeCache::default();

            let snapshot = resolver(&hub, &cache, &root)
                .resolve(&SnapshotRequest::new("org/model").jobs(jobs))?;

            let entry = snapshot.folder.join("weights.bin.lock");
            assert!(snapshot.folder.join("weights.bin").is_file());
            assert_eq!(
                fs::read_to_string(&entry)?,
                "https://hub.example/org/model/resolve/abc123/weights.bin.lock",
                "{names:?}"
            );
            assert_eq!(lock_files(root.path()), [entry]);
        }
        Ok(())
    }

    #[test]
    fn deadline_bounds_each_transfer() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let hub = FakeHub::new(&["config.json", "pytorch_model.bin"]);
        let cache = FakeCache::default();
        let resolver = resolver(&hub, &cache, &root);

        resolver.resolve(&SnapshotRequest::new("org/model"))?;
        assert_eq!(cache.timeouts(), [None, None]);

        let limit = Duration::from_secs(30);
        resolver.resolve(
            &SnapshotRequest::new("org/model")
                .timeout(limit)
                .force_download(true),
        )?;
        let bounded = &cache.timeouts()[2..];
        assert_eq!(bounded.len(), 2);
        assert!(bounded
            .iter()
            .all(|timeout| timeout.is_some_and(|t| t > Duration::ZERO && t <= limit)));
        Ok(())
    }

    #[test]
    fn explicit_jobs_win_over_configured_default() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let env = crate::config::EnvSnapshot::testing(&[("HUBSNAP_JOBS", "8")]);
        let config = Config::from_snapshot(&env, Some(home.path().to_path_buf()))?;

        let sequential = with_config_defaults(&SnapshotRequest::new("org/model").jobs(1), &config);
        assert_eq!(sequential.jobs, Some(1));

        let defaulted = with_config_defaults(&SnapshotRequest::new("org/model"), &config);
        assert_eq!(defaulted.jobs, Some(8));
        Ok(())
    }

    #[test]
    fn resolve_snapshot_rejects_invalid_ids_before_reading_config() {
        let err = resolve_snapshot("org__model", None, None::<PathBuf>, None)
            .expect_err("separator in id");
        assert!(matches!(err, SnapshotError::InvalidIdentifier { .. }));

        let err = resolve_snapshot(
            "a/b/c",
            Some("main"),
            Some("relative-cache"),
            Some(Framework::Pytorch),
        )
        .expect_err("too many segments");
        assert!(matches!(err, SnapshotError::InvalidIdentifier { .. }));
    }
}
