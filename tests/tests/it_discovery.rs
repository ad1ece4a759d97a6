//! Remote discovery over a seeded in-memory store.

use data_store::remote;
use tests::test_support::{base_config_file, build_env, cur_batch, seed_partition, seeded_env};

#[tokio::test]
async fn window_filter_selects_partitions_in_ascending_order() {
    let env = seeded_env(base_config_file(), None).await;

    // Partitions outside the window, plus noise discovery must skip.
    seed_partition(
        &env.store,
        env.config.export_type,
        "2025-03",
        &[("old.parquet", &cur_batch(&[("ec2", 1.0)]))],
    )
    .await;
    seed_partition(
        &env.store,
        env.config.export_type,
        "2025-08",
        &[("new.parquet", &cur_batch(&[("ec2", 1.0)]))],
    )
    .await;
    env.store
        .put_bytes("garbage/readme.txt", b"not a partition".to_vec())
        .await
        .unwrap();
    env.store
        .put_bytes("BILLING_PERIOD=not-a-date/x.parquet", b"PAR1".to_vec())
        .await
        .unwrap();

    let listing = remote::list(&env.config, &env.store).await.unwrap();
    let suffixes: Vec<&str> = listing.files.iter().map(|f| f.suffix.as_str()).collect();
    assert_eq!(
        suffixes,
        [
            "BILLING_PERIOD=2025-05/a.parquet",
            "BILLING_PERIOD=2025-06/b.parquet",
            "BILLING_PERIOD=2025-07/c.parquet",
        ]
    );
    assert_eq!(listing.stats.partitions_seen, 7);
    assert_eq!(listing.stats.partitions_skipped, 2);
    assert_eq!(listing.stats.partitions_selected, 3);

    // Every emitted file carries its partition and a known size.
    for file in &listing.files {
        assert!(file.partition.is_some());
        assert!(file.size.unwrap() > 0);
    }
}

#[tokio::test]
async fn empty_result_is_legal() {
    let mut file = base_config_file();
    file.date_start = Some("2030-01".into());
    file.date_end = Some("2030-12".into());
    let env = build_env(file);
    seed_partition(
        &env.store,
        env.config.export_type,
        "2025-05",
        &[("a.parquet", &cur_batch(&[("ec2", 1.0)]))],
    )
    .await;

    let listing = remote::list(&env.config, &env.store).await.unwrap();
    assert!(listing.files.is_empty());
    assert_eq!(listing.stats.partitions_selected, 0);
}

#[tokio::test]
async fn foreign_and_empty_files_are_dropped() {
    let env = seeded_env(base_config_file(), None).await;
    env.store
        .put_bytes("BILLING_PERIOD=2025-06/manifest.json", b"{}".to_vec())
        .await
        .unwrap();
    env.store
        .put_bytes("BILLING_PERIOD=2025-06/empty.parquet", Vec::new())
        .await
        .unwrap();

    let listing = remote::list(&env.config, &env.store).await.unwrap();
    let june: Vec<&str> = listing
        .files
        .iter()
        .filter(|f| f.suffix.starts_with("BILLING_PERIOD=2025-06/"))
        .map(|f| f.suffix.as_str())
        .collect();
    assert_eq!(june, ["BILLING_PERIOD=2025-06/b.parquet"]);
}

#[tokio::test]
async fn list_partitions_ignores_the_window() {
    let env = seeded_env(base_config_file(), None).await;
    seed_partition(
        &env.store,
        env.config.export_type,
        "2025-03",
        &[("old.parquet", &cur_batch(&[("ec2", 1.0)]))],
    )
    .await;

    let partitions = remote::list_partitions(&env.config, &env.store)
        .await
        .unwrap();
    let values: Vec<String> = partitions.iter().map(|p| p.value.to_string()).collect();
    assert_eq!(values, ["2025-03", "2025-05", "2025-06", "2025-07"]);
}
