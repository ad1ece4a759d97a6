//! Transfer: mirror the remote file set into the local cache.
//!
//! Files are fetched by a bounded worker pool, staged under a temporary name
//! and atomically renamed into place, so readers never observe a partial
//! file. A file already present with an identical size is skipped; a
//! differing size means the remote changed and the file is overwritten.
//! Transient store errors are retried with capped exponential backoff. A
//! failed file does not abort the run; it lands in the report.

use std::path::Path;

use backon::{ExponentialBuilder, Retryable};
use common::{DataConfig, Store};
use fs_err as fs;
use futures::StreamExt;
use object_store::path::Path as StorePath;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheError, CacheLock, LocalCache, SyncManifest, STAGING_SUFFIX};
use crate::remote::{self, DiscoveryError};
use crate::FileRef;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Concurrent file transfers.
    pub parallelism: usize,

    /// Re-download files even when the local size already matches.
    pub force_overwrite: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            parallelism: 5,
            force_overwrite: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub transferred: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedTransfer>,
    pub bytes_transferred: u64,
}

#[derive(Debug)]
pub struct FailedTransfer {
    pub suffix: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync requires a local_root in the data-source config")]
    NoLocalRoot,

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("sync was cancelled")]
    Cancelled,
}

/// Mirrors the window's remote files into the local cache. Exactly one sync
/// may run per cache root; a concurrent attempt fails fast with `Conflict`.
#[instrument(skip_all, err)]
pub async fn sync(
    config: &DataConfig,
    store: &Store,
    options: SyncOptions,
    cancel: &CancellationToken,
) -> Result<SyncReport, SyncError> {
    let cache = LocalCache::new(config).ok_or(SyncError::NoLocalRoot)?;
    let _lock = CacheLock::acquire(cache.root())?;

    reclaim_staging(cache.root())?;

    let listing = remote::list(config, store).await?;
    debug!(
        files = listing.files.len(),
        partitions = listing.stats.partitions_selected,
        "remote listing complete"
    );

    let outcomes = futures::stream::iter(
        listing
            .files
            .iter()
            .map(|file| transfer_one(store, &cache, file, &options, cancel)),
    )
    .buffer_unordered(options.parallelism.max(1))
    .collect::<Vec<Outcome>>()
    .await;

    let mut report = SyncReport::default();
    let mut cancelled = false;
    for outcome in outcomes {
        match outcome {
            Outcome::Transferred { suffix, bytes } => {
                report.bytes_transferred += bytes;
                report.transferred.push(suffix);
            }
            Outcome::Skipped { suffix } => report.skipped.push(suffix),
            Outcome::Failed { suffix, error } => {
                warn!(%suffix, %error, "file transfer failed");
                report.failed.push(FailedTransfer { suffix, error });
            }
            Outcome::Cancelled => cancelled = true,
        }
    }
    if cancelled {
        return Err(SyncError::Cancelled);
    }

    // The manifest records the remote set as of this sync's completion;
    // partition completeness is judged against it.
    SyncManifest::from_listing(&listing.files).save(cache.root())?;

    info!(
        transferred = report.transferred.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        bytes = report.bytes_transferred,
        "sync complete"
    );
    Ok(report)
}

enum Outcome {
    Transferred { suffix: String, bytes: u64 },
    Skipped { suffix: String },
    Failed { suffix: String, error: String },
    Cancelled,
}

async fn transfer_one(
    store: &Store,
    cache: &LocalCache,
    file: &FileRef,
    options: &SyncOptions,
    cancel: &CancellationToken,
) -> Outcome {
    let suffix = file.suffix.clone();
    let dest = cache.path_for(file);

    if !options.force_overwrite {
        if let (Ok(metadata), Some(remote_size)) = (fs::metadata(&dest), file.size) {
            if metadata.len() == remote_size {
                return Outcome::Skipped { suffix };
            }
        }
    }

    let work = async {
        let staged = dest.with_file_name(format!("{}{}", file.file_name(), STAGING_SUFFIX));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = (|| download(store, &file.suffix, &staged))
            .retry(ExponentialBuilder::default())
            .when(TransferError::is_transient)
            .notify(|err, dur| {
                warn!(
                    suffix = %file.suffix,
                    error = %err,
                    "transient transfer error, retrying in {:.1}s",
                    dur.as_secs_f32()
                );
            })
            .await?;

        fs::rename(&staged, &dest)?;
        Ok::<u64, TransferError>(bytes)
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = work => match result {
            Ok(bytes) => Outcome::Transferred { suffix, bytes },
            Err(e) => Outcome::Failed { suffix, error: e.to_string() },
        },
    }
}

#[derive(Debug, thiserror::Error)]
enum TransferError {
    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Store(
                object_store::Error::Generic { .. } | object_store::Error::JoinError { .. }
            )
        )
    }
}

/// Streams one object into its staged path and returns the byte count.
async fn download(store: &Store, suffix: &str, staged: &Path) -> Result<u64, TransferError> {
    let mut body = store
        .prefixed_store()
        .get(&StorePath::from(suffix))
        .await?
        .into_stream();
    let mut out = fs_err::tokio::File::create(staged).await?;
    let mut bytes = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        bytes += chunk.len() as u64;
        out.write_all(&chunk).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(bytes)
}

/// Removes temporaries left by an interrupted transfer. Only runs under the
/// advisory lock.
fn reclaim_staging(root: &Path) -> Result<(), CacheError> {
    if !root.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if entry.metadata()?.is_dir() {
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let file_name = file.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                if file_name.contains(STAGING_SUFFIX) {
                    debug!(path = %file.path().display(), "reclaiming staged temporary");
                    fs::remove_file(file.path())?;
                }
            }
        } else if name.contains(STAGING_SUFFIX) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
