//! End-to-end dispatcher behavior: source selection, safety, the error
//! taxonomy, output formats, cancellation.

use std::time::Duration;

use data_store::sync::{sync, SyncOptions};
use query::{DataSource, ErrorKind, Output, OutputFormat, QueryOptions};
use tests::test_support::{
    base_config_file, cur_batch, parquet_bytes, seeded_env, single_i64,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn count_over_remote_files() {
    let env = seeded_env(base_config_file(), None).await;
    let response = env
        .dispatcher
        .query("SELECT COUNT(*) FROM CUR", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.metadata.data_source, DataSource::Remote);
    assert_eq!(response.metadata.engine, "datafusion");
    assert_eq!(response.metadata.rows, 1);
    assert_eq!(single_i64(response.output.as_frame().unwrap()), 4);
}

#[tokio::test]
async fn cache_preference_and_local_remote_row_equality() {
    let local = tempfile::tempdir().unwrap();
    let env = seeded_env(base_config_file(), Some(local.path().to_path_buf())).await;
    sync(
        &env.config,
        &env.store,
        SyncOptions::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let sql = "SELECT COUNT(*) FROM CUR";
    let local_response = env
        .dispatcher
        .query(sql, QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(local_response.metadata.data_source, DataSource::Local);

    let remote_response = env
        .dispatcher
        .query(
            sql,
            QueryOptions {
                force_remote: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(remote_response.metadata.data_source, DataSource::Remote);

    // Round-trip law: local and remote agree on the rows.
    assert_eq!(
        single_i64(local_response.output.as_frame().unwrap()),
        single_i64(remote_response.output.as_frame().unwrap()),
    );
}

#[tokio::test]
async fn rejected_write_names_the_rule() {
    let env = seeded_env(base_config_file(), None).await;
    let error = env
        .dispatcher
        .query("DELETE FROM CUR", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::InvalidQuery);
    assert!(error.message.contains("only read statements are admitted"));
}

#[tokio::test]
async fn unknown_column_surfaces_candidates_and_original() {
    let env = seeded_env(base_config_file(), None).await;
    let error = env
        .dispatcher
        .query("SELECT unblended FROM CUR", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::UnknownColumn);
    assert!(
        error
            .suggestions
            .iter()
            .any(|s| s.contains("line_item_unblended_cost")),
        "suggestions: {:?}",
        error.suggestions
    );
    assert!(error.original.is_some());
    // The raw engine text never becomes the primary message.
    assert_ne!(Some(error.message.as_str()), error.original.as_deref());
}

#[tokio::test]
async fn unknown_table_lists_known_names() {
    let env = seeded_env(base_config_file(), None).await;
    let error = env
        .dispatcher
        .query("SELECT * FROM expenses", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::UnknownTable);
    assert!(error.suggestions.iter().any(|s| s.contains("CUR")));
}

#[tokio::test]
async fn direct_file_target_registers_a_one_file_table() {
    let env = seeded_env(base_config_file(), None).await;
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("july.parquet");
    fs_err::write(&path, parquet_bytes(&cur_batch(&[("ec2", 1.0), ("s3", 2.0)]))).unwrap();

    let response = env
        .dispatcher
        .query(path.to_str().unwrap(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.metadata.data_source, DataSource::DirectFile);
    assert_eq!(response.metadata.rows, 2);
}

#[tokio::test]
async fn stored_sql_loads_from_the_library_root() {
    let library = tempfile::tempdir().unwrap();
    fs_err::write(
        library.path().join("count_rows.sql"),
        "SELECT COUNT(*) FROM CUR",
    )
    .unwrap();
    let mut file = base_config_file();
    file.query_library_root = Some(library.path().to_path_buf());
    let env = seeded_env(file, None).await;

    let response = env
        .dispatcher
        .query("count_rows.sql", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.metadata.data_source, DataSource::Remote);
    assert_eq!(single_i64(response.output.as_frame().unwrap()), 4);
}

#[tokio::test]
async fn row_limit_bounds_are_enforced_and_applied() {
    let env = seeded_env(base_config_file(), None).await;

    let response = env
        .dispatcher
        .query(
            "SELECT product_servicecode FROM CUR",
            QueryOptions {
                row_limit: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.metadata.rows, 1);

    let error = env
        .dispatcher
        .query(
            "SELECT 1",
            QueryOptions {
                row_limit: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::InvalidQuery);
}

#[tokio::test]
async fn output_formats_render() {
    let env = seeded_env(base_config_file(), None).await;

    let response = env
        .dispatcher
        .query(
            "SELECT product_servicecode, line_item_unblended_cost FROM CUR ORDER BY line_item_unblended_cost DESC",
            QueryOptions {
                output_format: OutputFormat::JsonRows,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let Output::Json(json) = &response.output else {
        panic!("expected json output");
    };
    let rows: Vec<serde_json::Value> = serde_json::from_str(json).unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0]["product_servicecode"], "ec2");

    let response = env
        .dispatcher
        .query(
            "SELECT product_servicecode FROM CUR",
            QueryOptions {
                output_format: OutputFormat::Csv,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let Output::Csv(csv) = &response.output else {
        panic!("expected csv output");
    };
    assert_eq!(csv.lines().next(), Some("product_servicecode"));
}

#[tokio::test]
async fn cancelled_query_returns_cancelled() {
    let env = seeded_env(base_config_file(), None).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = env
        .dispatcher
        .query(
            "SELECT COUNT(*) FROM CUR",
            QueryOptions {
                cancel: Some(cancel),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn empty_window_is_not_found_with_partition_suggestions() {
    let mut file = base_config_file();
    file.date_start = Some("2030-01".into());
    file.date_end = Some("2030-12".into());
    let env = tests::test_support::build_env(file);
    for (value, name) in [("2025-05", "a.parquet"), ("2025-06", "b.parquet")] {
        env.store
            .put_bytes(
                format!("BILLING_PERIOD={value}/{name}").as_str(),
                parquet_bytes(&cur_batch(&[("ec2", 1.0)])),
            )
            .await
            .unwrap();
    }

    let error = env
        .dispatcher
        .query("SELECT COUNT(*) FROM CUR", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert!(
        error.suggestions.iter().any(|s| s.contains("2025-06")),
        "suggestions: {:?}",
        error.suggestions
    );
}

#[tokio::test]
async fn format_migration_window_is_rejected_not_truncated() {
    let env = seeded_env(base_config_file(), None).await;
    // A legacy gzipped-CSV partition inside the same window.
    env.store
        .put_bytes(
            "BILLING_PERIOD=2025-07/legacy.csv.gz",
            b"not really gzip, never read".to_vec(),
        )
        .await
        .unwrap();

    let error = env
        .dispatcher
        .query("SELECT COUNT(*) FROM CUR", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.message.contains("mixes"), "message: {}", error.message);
    assert!(
        error.suggestions.iter().any(|s| s.contains("date_start")),
        "suggestions: {:?}",
        error.suggestions
    );
}

#[tokio::test]
async fn deadline_dominates_execution() {
    let env = seeded_env(base_config_file(), None).await;
    // A generous deadline lets the query finish normally.
    let response = env
        .dispatcher
        .query(
            "SELECT COUNT(*) FROM CUR",
            QueryOptions {
                deadline: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.metadata.rows, 1);
}

#[tokio::test]
async fn schema_probe_lists_base_columns() {
    let env = seeded_env(base_config_file(), None).await;
    let schema = env.dispatcher.schema().await.unwrap();
    let names: Vec<&str> = schema.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"product_servicecode"));
    assert!(names.contains(&"line_item_unblended_cost"));
}

#[tokio::test]
async fn catalog_summarizes_the_config() {
    let env = seeded_env(base_config_file(), None).await;
    let catalog = env.dispatcher.catalog();
    assert_eq!(catalog.engine, "datafusion");
    assert_eq!(catalog.table_name, "CUR");
    assert_eq!(catalog.export_type, "CUR2.0");
    assert_eq!(catalog.partition_token, "BILLING_PERIOD");
    assert!(!catalog.cache_usable);
    assert_eq!(catalog.date_start.as_deref(), Some("2025-05"));
}
