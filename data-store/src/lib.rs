//! Partition-aware discovery, the local content cache, and transfer.
//!
//! Both the remote and the local side of the data plane speak in `FileRef`s:
//! a concrete content file, the partition it belongs to, and where its bytes
//! live. Discovery (remote) and the cache (local) emit them in the same
//! order, so the query layer can treat either as "the file set".

pub mod cache;
pub mod remote;
pub mod sync;

use std::path::{Path, PathBuf};

use common::{ContentFormat, Partition};
use url::Url;

/// A single content file, remote or cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Path relative to the export prefix, e.g.
    /// `BILLING_PERIOD=2025-05/part-00001.parquet`.
    pub suffix: String,

    /// The partition this file belongs to. `None` for files outside the
    /// export layout (direct-file targets, materialized view outputs).
    pub partition: Option<Partition>,

    pub format: ContentFormat,

    /// Known byte size, when the backing store reported one.
    pub size: Option<u64>,

    pub location: FileLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLocation {
    Remote(Url),
    Local(PathBuf),
}

impl FileRef {
    /// A reference to a standalone local columnar file (a direct-file query
    /// target). Returns `None` when the path is not a recognized content file.
    pub fn standalone(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let format = ContentFormat::from_file_name(name)?;
        let size = fs_err::metadata(path).ok().map(|m| m.len());
        Some(Self {
            suffix: name.to_string(),
            partition: None,
            format,
            size,
            location: FileLocation::Local(path.to_path_buf()),
        })
    }

    pub fn file_name(&self) -> &str {
        self.suffix.rsplit('/').next().unwrap_or(&self.suffix)
    }

    /// The URL the query engine reads this file through.
    pub fn url(&self) -> Result<Url, FileRefError> {
        match &self.location {
            FileLocation::Remote(url) => Ok(url.clone()),
            FileLocation::Local(path) => {
                Url::from_file_path(path).map_err(|_| FileRefError::NotAbsolute(path.clone()))
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.location, FileLocation::Local(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileRefError {
    #[error("local file path is not absolute: {0}")]
    NotAbsolute(PathBuf),
}

/// The ordering rule shared by discovery and the cache:
/// (partition ascending, object name ascending).
pub fn sort_file_refs(files: &mut [FileRef]) {
    files.sort_by(|a, b| {
        (a.partition, &a.suffix).cmp(&(b.partition, &b.suffix))
    });
}
