//! Transfer into the local cache: idempotence, atomicity, the advisory lock.

use data_store::cache::{CacheLock, LocalCache, STAGING_SUFFIX, SYNC_MANIFEST_FILE};
use data_store::sync::{sync, SyncError, SyncOptions};
use tests::test_support::{base_config_file, seeded_env};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sync_mirrors_remote_layout_and_is_idempotent() {
    let local = tempfile::tempdir().unwrap();
    let env = seeded_env(base_config_file(), Some(local.path().to_path_buf())).await;
    let cancel = CancellationToken::new();

    let report = sync(&env.config, &env.store, SyncOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(report.transferred.len(), 3);
    assert!(report.failed.is_empty());
    assert!(report.bytes_transferred > 0);

    // The mirror matches the remote suffix layout exactly.
    for suffix in [
        "BILLING_PERIOD=2025-05/a.parquet",
        "BILLING_PERIOD=2025-06/b.parquet",
        "BILLING_PERIOD=2025-07/c.parquet",
    ] {
        assert!(local.path().join(suffix).is_file(), "missing {suffix}");
    }
    assert!(local.path().join(SYNC_MANIFEST_FILE).is_file());

    // No staged temporaries and no lock file survive the run.
    for entry in walkdir(local.path()) {
        let name = entry.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains(STAGING_SUFFIX), "leftover staging file {name}");
        assert_ne!(name, ".curq.lock");
    }

    // Every partition is complete after a full sync.
    let cache = LocalCache::new(&env.config).unwrap();
    let status = cache.status().unwrap();
    assert_eq!(status.len(), 3);
    assert!(status.values().all(|s| s.complete));
    assert!(cache.is_usable());

    // A second run with no remote changes transfers zero bytes and leaves
    // the entry count unchanged.
    let before = cache.list_files().unwrap().len();
    let report = sync(&env.config, &env.store, SyncOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(report.transferred.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(report.bytes_transferred, 0);
    assert_eq!(cache.list_files().unwrap().len(), before);
}

#[tokio::test]
async fn concurrent_sync_fails_fast_with_conflict() {
    let local = tempfile::tempdir().unwrap();
    let env = seeded_env(base_config_file(), Some(local.path().to_path_buf())).await;

    let _held = CacheLock::acquire(local.path()).unwrap();
    let error = sync(
        &env.config,
        &env.store,
        SyncOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        error,
        SyncError::Cache(data_store::cache::CacheError::Conflict(_))
    ));
}

#[tokio::test]
async fn cancelled_sync_yields_cancelled_not_partial_success() {
    let local = tempfile::tempdir().unwrap();
    let env = seeded_env(base_config_file(), Some(local.path().to_path_buf())).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = sync(&env.config, &env.store, SyncOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, SyncError::Cancelled));
}

#[tokio::test]
async fn sync_without_local_root_is_rejected() {
    let env = seeded_env(base_config_file(), None).await;
    let error = sync(
        &env.config,
        &env.store,
        SyncOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, SyncError::NoLocalRoot));
}

fn walkdir(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = vec![];
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs_err::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}
