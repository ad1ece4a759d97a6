//! The local content cache: an on-disk mirror of the remote partition layout.
//!
//! Layout: `<local_root>/<path-relative-to-prefix>`, byte-for-byte copies,
//! partition directory names identical to the remote ones (token case
//! included). A hidden manifest records the remote file set as of the last
//! completed sync; completeness is judged against it, per partition. A
//! hidden marker file at the cache root is the advisory lock for writers.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use common::{DataConfig, Partition};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{sort_file_refs, FileLocation, FileRef};

pub const SYNC_MANIFEST_FILE: &str = ".curq-sync.json";
pub const LOCK_FILE: &str = ".curq.lock";

/// Name infix for files being staged by a transfer; anything carrying it is
/// invisible to readers and reclaimed by the next sync.
pub const STAGING_SUFFIX: &str = ".curq-part";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("another sync holds the cache lock at {0}")]
    Conflict(PathBuf),

    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sync manifest is corrupt: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStatus {
    pub file_count: usize,
    pub total_bytes: u64,

    /// True iff every file the last sync saw remotely for this partition is
    /// present locally with a matching size. Size is the only integrity
    /// check; there is no hashing.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearReport {
    pub files_removed: usize,
    pub bytes_removed: u64,
}

pub struct LocalCache {
    root: PathBuf,
    config: DataConfig,
}

impl LocalCache {
    /// `None` when the config has no local root: there is no cache.
    pub fn new(config: &DataConfig) -> Option<Self> {
        Some(Self {
            root: config.local_root.clone()?,
            config: config.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where a file reference lands (or lives) on disk.
    pub fn path_for(&self, file: &FileRef) -> PathBuf {
        self.root.join(&file.suffix)
    }

    /// Cached content files within the configured window, in the same
    /// (partition, name) order discovery uses. Staged files are invisible.
    pub fn list_files(&self) -> Result<Vec<FileRef>, CacheError> {
        let mut files = vec![];
        for (partition, dir) in self.partition_dirs()? {
            if !self.config.window.contains(&partition.value) {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.contains(STAGING_SUFFIX) || !self.config.export_type.accepts(name) {
                    continue;
                }
                let metadata = entry.metadata()?;
                if !metadata.is_file() || metadata.len() == 0 {
                    continue;
                }
                // Unwrap: `accepts` only passes names with a known format.
                let format = common::ContentFormat::from_file_name(name).unwrap();
                files.push(FileRef {
                    suffix: format!("{}/{}", partition.dir_name(), name),
                    partition: Some(partition),
                    format,
                    size: Some(metadata.len()),
                    location: FileLocation::Local(entry.path()),
                });
            }
        }
        sort_file_refs(&mut files);
        Ok(files)
    }

    /// Per-partition cache state, for every partition present locally.
    pub fn status(&self) -> Result<BTreeMap<Partition, PartitionStatus>, CacheError> {
        let manifest = SyncManifest::load(&self.root)?.unwrap_or_default();
        let mut statuses = BTreeMap::new();
        for (partition, dir) in self.partition_dirs()? {
            let mut status = PartitionStatus::default();
            let mut local_sizes: BTreeMap<String, u64> = BTreeMap::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if name.contains(STAGING_SUFFIX) || !self.config.export_type.accepts(name) {
                    continue;
                }
                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                status.file_count += 1;
                status.total_bytes += metadata.len();
                local_sizes.insert(name.to_string(), metadata.len());
            }
            status.complete = match manifest.partitions.get(&partition.dir_name()) {
                Some(entries) => entries
                    .iter()
                    .all(|e| local_sizes.get(&e.name) == Some(&e.size)),
                // Never synced: nothing to be complete against.
                None => false,
            };
            statuses.insert(partition, status);
        }
        Ok(statuses)
    }

    /// True iff the root exists and holds at least one content file in a
    /// partition matching the current window.
    pub fn is_usable(&self) -> bool {
        match self.list_files() {
            Ok(files) => !files.is_empty(),
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "cache unusable");
                false
            }
        }
    }

    /// Explicit operator eviction. Refuses while a sync holds the lock.
    pub fn clear(&self) -> Result<ClearReport, CacheError> {
        if self.root.join(LOCK_FILE).exists() {
            return Err(CacheError::Conflict(self.root.join(LOCK_FILE)));
        }
        let mut report = ClearReport {
            files_removed: 0,
            bytes_removed: 0,
        };
        for status in self.status()?.values() {
            report.files_removed += status.file_count;
            report.bytes_removed += status.total_bytes;
        }
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        Ok(report)
    }

    fn partition_dirs(&self) -> Result<Vec<(Partition, PathBuf)>, CacheError> {
        if !self.root.is_dir() {
            return Ok(vec![]);
        }
        // Absolute paths: the engine turns these into file:// URLs.
        let root = fs::canonicalize(&self.root)?;
        let mut dirs = vec![];
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.metadata()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match Partition::parse_dir_name(self.config.export_type, name) {
                Ok(partition) => dirs.push((partition, entry.path())),
                Err(_) => continue,
            }
        }
        dirs.sort_by_key(|(partition, _)| *partition);
        Ok(dirs)
    }
}

/// The remote file set as of the last completed sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncManifest {
    /// Partition directory name → content files seen remotely.
    pub partitions: BTreeMap<String, Vec<ManifestEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
}

impl SyncManifest {
    pub fn from_listing(files: &[FileRef]) -> Self {
        let mut manifest = Self::default();
        for file in files {
            let Some(partition) = &file.partition else {
                continue;
            };
            manifest
                .partitions
                .entry(partition.dir_name())
                .or_default()
                .push(ManifestEntry {
                    name: file.file_name().to_string(),
                    size: file.size.unwrap_or(0),
                });
        }
        manifest
    }

    pub fn load(root: &Path) -> Result<Option<Self>, CacheError> {
        let path = root.join(SYNC_MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Staged write: the manifest itself must never be visible half-written.
    pub fn save(&self, root: &Path) -> Result<(), CacheError> {
        let staged = root.join(format!("{SYNC_MANIFEST_FILE}{STAGING_SUFFIX}"));
        let mut out = fs::File::create(&staged)?;
        out.write_all(&serde_json::to_vec_pretty(self)?)?;
        out.sync_all()?;
        drop(out);
        fs::rename(&staged, root.join(SYNC_MANIFEST_FILE))?;
        Ok(())
    }
}

/// Advisory lock over a cache root: a hidden marker file created with
/// `create_new`. Held for the duration of a sync, removed on drop. The scope
/// is the `local_root`, so two syncs over the same root conflict even with
/// different configs.
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub fn acquire(root: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CacheError::Conflict(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
