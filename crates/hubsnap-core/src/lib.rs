//! Resolve hub repositories to immutable, fully populated local snapshots.
//!
//! A snapshot lives at `<cache root>/<owner>__<name>.<content id>`. The
//! content id is the immutable commit a revision resolves to, so a folder
//! name fully determines its contents.

mod config;
mod error;
mod framework;
mod hub;
mod list;
mod outcome;
mod repo;
mod snapshot;

pub use config::{CacheLocation, Config, ConfigError, DEFAULT_HTTP_TIMEOUT};
pub use error::{ResolutionError, SnapshotError};
pub use framework::{filter_manifest, Framework, ALWAYS_KEEP};
pub use hub::{
    hub_file_url, Endpoint, HubApi, ManifestEntry, MetadataSource, ResolvedManifest, DEFAULT_ENDPOINT,
    DEFAULT_REVISION,
};
pub use list::{list_cached_snapshots, CachedSnapshot};
pub use outcome::{CommandStatus, ExecutionOutcome};
pub use repo::{
    parse_storage_folder_name, storage_folder, storage_folder_name, ContentId, RepoId,
    REPO_ID_SEPARATOR,
};
pub use snapshot::{
    resolve_snapshot, resolve_snapshot_with, CancelToken, Snapshot, SnapshotRequest,
    SnapshotResolver,
};

pub use hubsnap_store::{FetchError, FetchRequest, FileCache, HttpFileCache};
