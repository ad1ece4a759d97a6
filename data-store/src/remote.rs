//! Remote discovery: turn the configured prefix into the concrete file set.
//!
//! The object store is the single source of truth; nothing here is cached
//! across calls.

use common::{DataConfig, Partition, Store, StoreError};
use futures::TryStreamExt;
use object_store::path::Path;
use tracing::{debug, instrument};

use crate::{FileLocation, FileRef};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("listing failed: {0}")]
    Store(#[from] StoreError),

    #[error("invalid file url: {0}")]
    Url(#[from] url::ParseError),
}

/// Counters for one discovery pass. Partitions that fail to parse are
/// skipped, not errors; the count surfaces here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub partitions_seen: usize,
    pub partitions_skipped: usize,
    pub partitions_selected: usize,
}

#[derive(Debug)]
pub struct Listing {
    /// In (partition ascending, object name ascending) order.
    pub files: Vec<FileRef>,
    pub stats: DiscoveryStats,
}

/// Lists the content files under the configured prefix, filtered by the date
/// window. An empty result is legal and surfaces as-is.
#[instrument(skip_all, fields(prefix = config.prefix), err)]
pub async fn list(config: &DataConfig, store: &Store) -> Result<Listing, DiscoveryError> {
    let mut stats = DiscoveryStats::default();
    let mut partitions = partition_dirs(config, store, &mut stats).await?;
    partitions.retain(|partition| config.window.contains(&partition.value));
    partitions.sort();
    stats.partitions_selected = partitions.len();

    let mut files = vec![];
    for partition in partitions {
        let dir = partition.dir_name();
        let mut objects = store.list(Path::from(dir.as_str()));
        let mut partition_files = vec![];
        while let Some(meta) = objects.try_next().await? {
            let Some(name) = meta.location.filename() else {
                continue;
            };
            if !config.export_type.accepts(name) || meta.size == 0 {
                continue;
            }
            // Unwrap: `accepts` only passes names with a known format.
            let format = common::ContentFormat::from_file_name(name).unwrap();
            let suffix = meta.location.to_string();
            partition_files.push(FileRef {
                location: FileLocation::Remote(store.file_url(&suffix)?),
                suffix,
                partition: Some(partition),
                format,
                size: Some(meta.size as u64),
            });
        }
        partition_files.sort_by(|a, b| a.suffix.cmp(&b.suffix));
        debug!(partition = %partition, files = partition_files.len(), "scanned partition");
        files.extend(partition_files);
    }

    Ok(Listing { files, stats })
}

/// All parseable partitions under the prefix, ignoring the window. Used for
/// operator introspection and for "nothing found" suggestions.
#[instrument(skip_all, err)]
pub async fn list_partitions(
    config: &DataConfig,
    store: &Store,
) -> Result<Vec<Partition>, DiscoveryError> {
    let mut stats = DiscoveryStats::default();
    let mut partitions = partition_dirs(config, store, &mut stats).await?;
    partitions.sort();
    Ok(partitions)
}

async fn partition_dirs(
    config: &DataConfig,
    store: &Store,
    stats: &mut DiscoveryStats,
) -> Result<Vec<Partition>, DiscoveryError> {
    let listing = store.list_shallow(None).await?;
    let mut partitions = vec![];
    for prefix in &listing.common_prefixes {
        let Some(dir_name) = prefix.filename() else {
            continue;
        };
        stats.partitions_seen += 1;
        match Partition::parse_dir_name(config.export_type, dir_name) {
            Ok(partition) => partitions.push(partition),
            Err(e) => {
                stats.partitions_skipped += 1;
                debug!(dir_name, error = %e, "skipping non-partition directory");
            }
        }
    }
    Ok(partitions)
}
