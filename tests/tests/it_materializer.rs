//! The view materializer end to end: dependency order, persistence,
//! registration, cycle rejection, abort-and-report.

use materializer::manifest::{Manifest, ManifestError};
use materializer::{MaterializeError, MaterializeOptions, Materializer};
use query::QueryOptions;
use tests::test_support::{base_config_file, seeded_env, single_i64};
use tokio_util::sync::CancellationToken;

const TWO_LEVEL_MANIFEST: &str = r#"
base_table = "CUR"

[views.service_totals]
sql = "SELECT product_servicecode, SUM(line_item_unblended_cost) AS total_cost FROM CUR GROUP BY product_servicecode"
depends_on = ["CUR"]

[views.top_service]
sql = "SELECT product_servicecode FROM service_totals ORDER BY total_cost DESC LIMIT 1"
depends_on = ["service_totals"]
"#;

#[tokio::test]
async fn run_materializes_levels_in_dependency_order() {
    let env = seeded_env(base_config_file(), None).await;
    let output = tempfile::tempdir().unwrap();
    let materializer = Materializer::new(
        env.dispatcher.clone(),
        output.path(),
        MaterializeOptions::default(),
    );
    let manifest = Manifest::from_toml(TWO_LEVEL_MANIFEST, "CUR").unwrap();

    let report = materializer
        .run(&manifest, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success(), "report: {report:?}");
    assert_eq!(report.produced, ["service_totals", "top_service"]);

    assert!(output.path().join("level_1/service_totals.parquet").is_file());
    assert!(output.path().join("level_2/top_service.parquet").is_file());

    // No staged temporaries left behind.
    for level in ["level_1", "level_2"] {
        for entry in fs_err::read_dir(output.path().join(level)).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name();
            assert!(
                !name.to_str().unwrap().contains(".stage"),
                "leftover {name:?}"
            );
        }
    }

    // Registrations were scoped to the run: the view name is gone again.
    let error = env
        .dispatcher
        .query("SELECT * FROM service_totals", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind, query::ErrorKind::UnknownTable);

    // The produced parquet is queryable as a direct file.
    let produced = output.path().join("level_1/service_totals.parquet");
    let response = env
        .dispatcher
        .query(produced.to_str().unwrap(), QueryOptions::default())
        .await
        .unwrap();
    // One row per distinct service in the fixture.
    assert_eq!(response.metadata.rows, 3);
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let env = seeded_env(base_config_file(), None).await;
    let output = tempfile::tempdir().unwrap();
    let materializer = Materializer::new(
        env.dispatcher.clone(),
        output.path(),
        MaterializeOptions::default(),
    );
    let manifest = Manifest::from_toml(TWO_LEVEL_MANIFEST, "CUR").unwrap();

    let first = materializer
        .run(&manifest, &CancellationToken::new())
        .await
        .unwrap();
    let second = materializer
        .run(&manifest, &CancellationToken::new())
        .await
        .unwrap();
    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(first.produced, second.produced);

    // Identical inputs, identical output content.
    let path = output.path().join("level_2/top_service.parquet");
    let response = env
        .dispatcher
        .query(path.to_str().unwrap(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.metadata.rows, 1);
}

#[tokio::test]
async fn cycle_fails_before_any_execution() {
    let env = seeded_env(base_config_file(), None).await;
    let output = tempfile::tempdir().unwrap();
    let materializer = Materializer::new(
        env.dispatcher.clone(),
        output.path(),
        MaterializeOptions::default(),
    );

    let manifest = Manifest::from_toml(
        r#"
        [views.a]
        sql = "SELECT * FROM b"
        depends_on = ["b"]

        [views.b]
        sql = "SELECT * FROM a"
        depends_on = ["a"]
        "#,
        "CUR",
    )
    .unwrap();

    let error = materializer
        .run(&manifest, &CancellationToken::new())
        .await
        .unwrap_err();
    match error {
        MaterializeError::Manifest(ManifestError::InvalidManifest { cycle }) => {
            assert_eq!(cycle, ["a", "b"]);
        }
        other => panic!("expected cycle error, got {other:?}"),
    }

    // Nothing was written.
    assert!(fs_err::read_dir(output.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn first_failure_aborts_and_reports_skipped_views() {
    let env = seeded_env(base_config_file(), None).await;
    let output = tempfile::tempdir().unwrap();
    let materializer = Materializer::new(
        env.dispatcher.clone(),
        output.path(),
        MaterializeOptions::default(),
    );

    let manifest = Manifest::from_toml(
        r#"
        [views.broken]
        sql = "SELECT no_such_column FROM CUR"
        depends_on = ["CUR"]

        [views.dependent]
        sql = "SELECT * FROM broken"
        depends_on = ["broken"]
        "#,
        "CUR",
    )
    .unwrap();

    let report = materializer
        .run(&manifest, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].view, "broken");
    assert_eq!(report.skipped, ["dependent"]);
    assert!(report.produced.is_empty());
}

#[tokio::test]
async fn cancelled_run_is_cancelled() {
    let env = seeded_env(base_config_file(), None).await;
    let output = tempfile::tempdir().unwrap();
    let materializer = Materializer::new(
        env.dispatcher.clone(),
        output.path(),
        MaterializeOptions::default(),
    );
    let manifest = Manifest::from_toml(TWO_LEVEL_MANIFEST, "CUR").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = materializer.run(&manifest, &cancel).await.unwrap_err();
    assert!(matches!(error, MaterializeError::Cancelled));
}

#[tokio::test]
async fn materialized_outputs_use_the_local_cache_when_preferred() {
    let local = tempfile::tempdir().unwrap();
    let env = seeded_env(base_config_file(), Some(local.path().to_path_buf())).await;
    data_store::sync::sync(
        &env.config,
        &env.store,
        Default::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let output = tempfile::tempdir().unwrap();
    let materializer = Materializer::new(
        env.dispatcher.clone(),
        output.path(),
        MaterializeOptions::default(),
    );
    let manifest = Manifest::from_toml(TWO_LEVEL_MANIFEST, "CUR").unwrap();
    let report = materializer
        .run(&manifest, &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());

    // The produced totals agree with a direct aggregate over the base table.
    let produced = output.path().join("level_1/service_totals.parquet");
    let response = env
        .dispatcher
        .query(produced.to_str().unwrap(), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(response.metadata.rows, 3);

    let count = env
        .dispatcher
        .query(
            "SELECT COUNT(DISTINCT product_servicecode) FROM CUR",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(single_i64(count.output.as_frame().unwrap()), 3);
}
